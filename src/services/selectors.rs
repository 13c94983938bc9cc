//! Markup knowledge about the directory, kept apart from the pipeline.
//!
//! The directory changes its markup without notice, so every selector the
//! pipeline relies on lives in a named, versioned `SelectorProfile`.

use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkStrategy {
    /// Anchors carrying the directory's result overlay class.
    OverlayClass(&'static str),
    /// Any anchor whose href contains all of the given fragments.
    HrefPattern(&'static [&'static str]),
    /// Anchors reached through the structure of a result card.
    Structural(&'static str),
}

impl LinkStrategy {
    pub fn css(&self) -> &'static str {
        match self {
            LinkStrategy::OverlayClass(css) => css,
            LinkStrategy::HrefPattern(_) => "a[href]",
            LinkStrategy::Structural(css) => css,
        }
    }

    pub fn accepts(&self, href: &str) -> bool {
        match self {
            LinkStrategy::HrefPattern(fragments) => fragments.iter().all(|f| href.contains(f)),
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorProfile {
    pub name: &'static str,
    pub feed: &'static str,
    pub end_of_list_markers: &'static [&'static str],
    pub link_strategies: Vec<LinkStrategy>,
    pub headings: &'static [&'static str],
    pub phone_label_prefix: &'static str,
    pub phone_label_controls: &'static [&'static str],
    pub phone_data_controls: &'static [&'static str],
    pub info_text_blocks: &'static [&'static str],
}

const FEED: &str = "div[role='feed']";
const END_OF_LIST: &[&str] = &["You've reached the end of the list"];
const HEADINGS: &[&str] = &["h1.DUwDvf", "h1"];
const PHONE_LABEL_CONTROLS: &[&str] = &["button[aria-label^='Phone']", "[aria-label^='Phone']"];
const PHONE_DATA_CONTROLS: &[&str] = &["button[data-item-id^='phone']", "[data-item-id*='phone']"];
const INFO_TEXT_BLOCKS: &[&str] = &["div.AeaXub div.Io6YTe", "div.Io6YTe", "div.fontBodyMedium"];

impl SelectorProfile {
    pub const PROFILE_NAMES: [&'static str; 3] =
        ["overlay-link-2023", "href-pattern-2024", "structural-2025"];

    pub fn by_name(name: &str) -> Option<Self> {
        let link_strategies = match name {
            "overlay-link-2023" => vec![LinkStrategy::OverlayClass("a.hfpxzc")],
            "href-pattern-2024" => vec![
                LinkStrategy::HrefPattern(&["/maps/place/", "!3d"]),
                LinkStrategy::OverlayClass("a.hfpxzc"),
            ],
            "structural-2025" => vec![
                LinkStrategy::Structural("div[role='article'] a[href]"),
                LinkStrategy::HrefPattern(&["/maps/place/"]),
            ],
            _ => return None,
        };

        let name = Self::PROFILE_NAMES.into_iter().find(|n| *n == name)?;

        Some(SelectorProfile {
            name,
            feed: FEED,
            end_of_list_markers: END_OF_LIST,
            link_strategies,
            headings: HEADINGS,
            phone_label_prefix: "Phone",
            phone_label_controls: PHONE_LABEL_CONTROLS,
            phone_data_controls: PHONE_DATA_CONTROLS,
            info_text_blocks: INFO_TEXT_BLOCKS,
        })
    }
}

impl Default for SelectorProfile {
    fn default() -> Self {
        SelectorProfile::by_name("href-pattern-2024").expect("built-in profile exists")
    }
}

/// Addressing scheme of the map directory.
#[derive(Debug, Clone)]
pub struct MapsDirectory {
    base_url: String,
}

impl MapsDirectory {
    pub const PLACE_MARKER: &'static str = "/place/";

    pub fn new(base_url: &str) -> Self {
        MapsDirectory {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn search_url(&self, query: &str) -> String {
        let query = query.split_whitespace().collect::<Vec<&str>>().join("+");
        format!("{}/search/{}", self.base_url, query)
    }

    pub fn is_detail_url(&self, url: &str) -> bool {
        url.starts_with(&self.base_url)
            && url[self.base_url.len()..].starts_with(Self::PLACE_MARKER)
    }

    pub fn resolve(&self, current_url: &str, href: &str) -> Option<String> {
        let base = Url::parse(current_url)
            .or_else(|_| Url::parse(&self.base_url))
            .ok()?;
        base.join(href).ok().map(|u| u.to_string())
    }

    /// Business name encoded in a detail url, e.g. `/place/Shree+Tyres/data=...`.
    pub fn name_from_url(&self, url: &str) -> Option<String> {
        let (_, rest) = url.split_once(Self::PLACE_MARKER)?;
        let segment = rest.split(['/', '?', '#']).next()?;
        let segment = segment.replace('+', " ");
        let decoded = urlencoding::decode(&segment).ok()?;
        let name = decoded.split_whitespace().collect::<Vec<&str>>().join(" ");

        match name.is_empty() {
            true => None,
            false => Some(name),
        }
    }
}
