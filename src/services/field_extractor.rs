use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tokio::time::{sleep, Instant};

use crate::domain::{CandidateLink, PhoneStrategy, RawExtraction};

use super::{waits, BrowserSession, MapsDirectory, PageError, SelectorProfile};

static LOOSE_PHONE: Lazy<Regex> = Lazy::new(|| {
    // An optional calling code, then at least three digit groups.
    Regex::new(r"(\+\d{1,3}[\s-]?)?\(?\d{2,5}\)?([\s.-]?\d{2,5}){2,4}")
        .expect("valid phone pattern")
});

const MIN_TEXT_PHONE_DIGITS: usize = 8;

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub heading_timeout: Duration,
    pub heading_text_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        ExtractionOptions {
            heading_timeout: Duration::from_secs(6),
            heading_text_timeout: Duration::from_secs(4),
            poll_interval: Duration::from_millis(250),
        }
    }
}

pub struct FieldExtractor {
    directory: MapsDirectory,
    profile: SelectorProfile,
    options: ExtractionOptions,
}

impl FieldExtractor {
    pub fn new(
        directory: MapsDirectory,
        profile: SelectorProfile,
        options: ExtractionOptions,
    ) -> Self {
        FieldExtractor {
            directory,
            profile,
            options,
        }
    }

    /// Opens the detail view behind `link` and reads whatever fields it
    /// exposes. Only a failed navigation is an error.
    pub async fn extract(
        &self,
        session: &mut dyn BrowserSession,
        link: &CandidateLink,
    ) -> Result<RawExtraction, PageError> {
        session.goto(&link.url).await?;

        let heading = waits::wait_for_any(
            session,
            self.profile.headings,
            self.options.heading_timeout,
            self.options.poll_interval,
        )
        .await
        .unwrap_or_else(|e| {
            log::warn!("Heading wait failed on {}: {}", link.url, e);
            None
        });

        let source = match heading {
            Some(_) => self.wait_for_heading_text(session).await?,
            None => {
                log::debug!("No heading on {}", link.url);
                session.source().await?
            }
        };

        Ok(self.read_page(&source, &link.url))
    }

    async fn wait_for_heading_text(
        &self,
        session: &mut dyn BrowserSession,
    ) -> Result<String, PageError> {
        let deadline = Instant::now() + self.options.heading_text_timeout;

        loop {
            let source = session.source().await?;
            if self.has_heading_text(&source) || Instant::now() >= deadline {
                return Ok(source);
            }
            sleep(
                self.options
                    .poll_interval
                    .min(deadline.saturating_duration_since(Instant::now())),
            )
            .await;
        }
    }

    fn has_heading_text(&self, html: &str) -> bool {
        heading_text(&Html::parse_document(html), &self.profile).is_some()
    }

    pub fn read_page(&self, html: &str, url: &str) -> RawExtraction {
        let document = Html::parse_document(html);

        let name =
            heading_text(&document, &self.profile).or_else(|| self.directory.name_from_url(url));
        let phone = phone_chain(&document, &self.profile);

        RawExtraction {
            name,
            raw_phone: phone.as_ref().map(|(raw, _)| raw.clone()),
            phone_strategy: phone.map(|(_, strategy)| strategy),
        }
    }
}

/// Runs the phone strategies in their fixed order and stops at the first hit.
pub fn phone_chain(document: &Html, profile: &SelectorProfile) -> Option<(String, PhoneStrategy)> {
    [
        PhoneStrategy::AccessibleLabel,
        PhoneStrategy::DataAttribute,
        PhoneStrategy::InfoText,
    ]
    .into_iter()
    .find_map(|strategy| {
        let found = match strategy {
            PhoneStrategy::AccessibleLabel => phone_from_label(document, profile),
            PhoneStrategy::DataAttribute => phone_from_data_attribute(document, profile),
            PhoneStrategy::InfoText => phone_from_info_text(document, profile),
        };
        found.map(|raw| (raw, strategy))
    })
}

pub fn heading_text(document: &Html, profile: &SelectorProfile) -> Option<String> {
    profile
        .headings
        .iter()
        .flat_map(|css| select_all(document, css))
        .map(element_text)
        .find(|text| !text.is_empty())
}

pub fn phone_from_label(document: &Html, profile: &SelectorProfile) -> Option<String> {
    profile
        .phone_label_controls
        .iter()
        .flat_map(|css| select_all(document, css))
        .filter_map(|el| el.value().attr("aria-label"))
        .filter_map(|label| strip_label(label, profile.phone_label_prefix))
        .find(|value| has_digits(value))
}

pub fn phone_from_data_attribute(document: &Html, profile: &SelectorProfile) -> Option<String> {
    profile
        .phone_data_controls
        .iter()
        .flat_map(|css| select_all(document, css))
        .filter_map(|el| {
            let tel = el
                .value()
                .attr("data-item-id")
                .and_then(|id| id.split_once("tel:"))
                .map(|(_, tel)| tel.trim().to_string());
            let label = el
                .value()
                .attr("aria-label")
                .and_then(|label| strip_label(label, profile.phone_label_prefix));

            [tel, label, Some(element_text(el))]
                .into_iter()
                .flatten()
                .find(|value| has_digits(value))
        })
        .next()
}

pub fn phone_from_info_text(document: &Html, profile: &SelectorProfile) -> Option<String> {
    profile
        .info_text_blocks
        .iter()
        .flat_map(|css| select_all(document, css))
        .map(element_text)
        .find_map(|text| {
            LOOSE_PHONE
                .find_iter(&text)
                .map(|m| m.as_str().trim().to_string())
                .find(|candidate| digit_count(candidate) >= MIN_TEXT_PHONE_DIGITS)
        })
}

fn select_all<'a>(document: &'a Html, css: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(css) {
        Ok(selector) => document.select(&selector).collect(),
        Err(_) => {
            log::error!("Invalid selector in profile: {}", css);
            vec![]
        }
    }
}

fn element_text(el: ElementRef) -> String {
    el.text()
        .collect::<Vec<&str>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

/// `"Phone: 098765 43210 "` becomes `"098765 43210"`.
fn strip_label(label: &str, prefix: &str) -> Option<String> {
    let value = label
        .trim()
        .strip_prefix(prefix)?
        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
        .trim();

    match value.is_empty() {
        true => None,
        false => Some(value.to_string()),
    }
}

fn has_digits(value: &str) -> bool {
    value.chars().any(|c| c.is_ascii_digit())
}

fn digit_count(value: &str) -> usize {
    value.chars().filter(|c| c.is_ascii_digit()).count()
}
