use std::collections::BTreeMap;

use serde::Deserialize;

use crate::collector::{Collector, FetchFuture, Normalized, RawPayload};
use crate::domain::{EntityKey, SourceType, UtcDateTime};

use super::{build_record, cursor_query, entity_list, parse_entries, HttpSource};

#[derive(Debug, Deserialize)]
struct ArticleEntry {
    symbol: String,
    published_at: UtcDateTime,
    /// Opaque model score in `[-1, 1]`.
    score: f64,
}

#[derive(Debug)]
struct DailyAggregate {
    sum: f64,
    count: u32,
    positive: u32,
    latest: UtcDateTime,
}

/// Per-entity daily news sentiment aggregated from scored articles.
///
/// Aggregates describe a whole UTC day, so incremental runs refetch from the
/// start of the cursor's day rather than from the cursor itself.
#[derive(Debug, Clone)]
pub struct SentimentCollector {
    http: HttpSource,
    entities: Vec<EntityKey>,
}

impl SentimentCollector {
    pub fn new(http: HttpSource, entities: Vec<EntityKey>) -> Self {
        Self { http, entities }
    }
}

impl Collector for SentimentCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Sentiment
    }

    fn fetch<'a>(&'a self, cursor: Option<UtcDateTime>) -> FetchFuture<'a> {
        Box::pin(async move {
            let mut query = vec![("symbols", entity_list(&self.entities))];
            query.extend(cursor_query(cursor.map(UtcDateTime::start_of_day)));
            self.http.get("/v1/articles", &query).await
        })
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        let mut normalized = Normalized::default();
        let mut daily: BTreeMap<(String, String), DailyAggregate> = BTreeMap::new();

        for article in parse_entries::<ArticleEntry>(payload, "articles", &mut normalized) {
            if !article.score.is_finite() || !(-1.0..=1.0).contains(&article.score) {
                normalized.drop_one("articles", "score outside [-1, 1]");
                continue;
            }
            let Ok(entity) = EntityKey::parse(&article.symbol) else {
                normalized.drop_one("articles", "invalid symbol");
                continue;
            };

            let key = (entity.to_string(), article.published_at.date());
            let aggregate = daily.entry(key).or_insert(DailyAggregate {
                sum: 0.0,
                count: 0,
                positive: 0,
                latest: article.published_at,
            });
            aggregate.sum += article.score;
            aggregate.count += 1;
            if article.score > 0.0 {
                aggregate.positive += 1;
            }
            aggregate.latest = aggregate.latest.max(article.published_at);
        }

        for ((entity, date), aggregate) in daily {
            let count = f64::from(aggregate.count);
            let record = build_record(
                SourceType::Sentiment,
                &entity,
                aggregate.latest,
                Some(&date),
                [
                    ("avg_score", Some(aggregate.sum / count)),
                    ("article_count", Some(count)),
                    ("positive_ratio", Some(f64::from(aggregate.positive) / count)),
                ],
            );
            normalized.push(record, "articles");
        }
        normalized
    }
}
