use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    domain::LeadRecord,
    services::{LeadStore, MergeReport},
};

pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        PgLeadStore { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run lead migrations")
    }
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    canonical_phone: String,
    company: String,
    location: String,
    keyword: String,
    source_link: String,
    observed_at: DateTime<Utc>,
}

impl From<LeadRow> for LeadRecord {
    fn from(row: LeadRow) -> Self {
        LeadRecord {
            company: row.company,
            canonical_phone: row.canonical_phone,
            location: row.location,
            keyword: row.keyword,
            source_link: row.source_link,
            observed_at: row.observed_at,
        }
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn merge(&self, batch: &[LeadRecord]) -> anyhow::Result<MergeReport> {
        let mut transaction = self
            .pool
            .begin()
            .await
            .context("Failed to open lead transaction")?;
        let mut report = MergeReport::default();

        for record in batch {
            let inserted: Option<bool> = sqlx::query_scalar(
                r#"
                insert into lead
                    (canonical_phone, company, location, keyword, source_link, observed_at)
                values
                    ($1, $2, $3, $4, $5, $6)
                on conflict (canonical_phone) do update
                set
                    company = excluded.company,
                    location = excluded.location,
                    keyword = excluded.keyword,
                    source_link = excluded.source_link,
                    observed_at = excluded.observed_at
                where
                    lead.observed_at <= excluded.observed_at
                    and (
                        lead.company, lead.location, lead.keyword,
                        lead.source_link, lead.observed_at
                    ) is distinct from (
                        excluded.company, excluded.location, excluded.keyword,
                        excluded.source_link, excluded.observed_at
                    )
                returning (xmax = 0) as inserted
                "#,
            )
            .bind(&record.canonical_phone)
            .bind(&record.company)
            .bind(&record.location)
            .bind(&record.keyword)
            .bind(&record.source_link)
            .bind(record.observed_at)
            .fetch_optional(&mut *transaction)
            .await
            .with_context(|| format!("Failed to upsert lead {}", record.canonical_phone))?;

            match inserted {
                Some(true) => report.inserted += 1,
                Some(false) => report.updated += 1,
                None => report.unchanged += 1,
            }
        }

        let total: i64 = sqlx::query_scalar("select count(*) from lead")
            .fetch_one(&mut *transaction)
            .await
            .context("Failed to count leads")?;
        report.total = total.max(0) as usize;

        transaction
            .commit()
            .await
            .context("Failed to commit lead transaction")?;

        Ok(report)
    }

    async fn load(&self) -> anyhow::Result<Vec<LeadRecord>> {
        let rows: Vec<LeadRow> = sqlx::query_as(
            r#"
            select
                canonical_phone,
                company,
                location,
                keyword,
                source_link,
                observed_at
            from
                lead
            order by observed_at, canonical_phone
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load leads")?;

        Ok(rows.into_iter().map(LeadRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use sqlx::PgPool;

    use super::PgLeadStore;
    use crate::{domain::LeadRecord, services::LeadStore};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, 0, 0).unwrap()
    }

    fn lead(company: &str, phone: &str, hour: u32) -> LeadRecord {
        LeadRecord {
            company: company.to_string(),
            canonical_phone: phone.to_string(),
            location: "Jodhpur".to_string(),
            keyword: "dealer".to_string(),
            source_link: format!("https://maps.example.com/maps/place/{}", company),
            observed_at: at(hour),
        }
    }

    #[ignore = "needs DATABASE_URL pointing at a postgres server"]
    #[sqlx::test(migrations = "./migrations")]
    async fn flushing_the_same_batch_twice_keeps_the_count(pool: PgPool) {
        let store = PgLeadStore::new(pool);
        let batch = vec![lead("Alpha", "9876543210", 9), lead("Beta", "9123456780", 10)];

        let first = store.merge(&batch).await.unwrap();
        let second = store.merge(&batch).await.unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.total, 2);
        assert_eq!(store.load().await.unwrap(), batch);
    }

    #[ignore = "needs DATABASE_URL pointing at a postgres server"]
    #[sqlx::test(migrations = "./migrations")]
    async fn newer_observation_wins_and_stale_one_is_unchanged(pool: PgPool) {
        let store = PgLeadStore::new(pool);
        store.merge(&[lead("Alpha", "9876543210", 9)]).await.unwrap();

        let newer = store.merge(&[lead("Alpha Tyres", "9876543210", 11)]).await.unwrap();
        let stale = store.merge(&[lead("Alpha Old", "9876543210", 8)]).await.unwrap();

        assert_eq!(newer.updated, 1);
        assert_eq!(stale.unchanged, 1);
        assert_eq!(stale.total, 1);
        let leads = store.load().await.unwrap();
        assert_eq!(leads, vec![lead("Alpha Tyres", "9876543210", 11)]);
    }

    #[ignore = "needs DATABASE_URL pointing at a postgres server"]
    #[sqlx::test(migrations = "./migrations")]
    async fn equal_observation_goes_to_the_incoming_record(pool: PgPool) {
        let store = PgLeadStore::new(pool);
        store.merge(&[lead("Alpha", "9876543210", 9)]).await.unwrap();

        let tie = store.merge(&[lead("Alpha Tyres", "9876543210", 9)]).await.unwrap();

        assert_eq!(tie.updated, 1);
        assert_eq!(
            store.load().await.unwrap(),
            vec![lead("Alpha Tyres", "9876543210", 9)]
        );
    }
}
