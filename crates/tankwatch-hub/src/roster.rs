use crate::monitor::MonitorHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tankwatch_core::{Roster, RosterBuilder};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_ROSTER_URL: &str = "https://ll.thespacedevs.com/2.3.0/space_stations/4/";
pub const DEFAULT_ROSTER_INTERVAL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{stage} fetch failed with status {status}")]
    Status { stage: &'static str, status: u16 },
    #[error("invalid {stage} response: missing {field} field (likely throttled)")]
    MissingField {
        stage: &'static str,
        field: &'static str,
    },
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch(&self) -> Result<Roster, RosterError>;
}

/// Two-stage roster fetch: the station lists its active expeditions, each
/// expedition lists its crew.
pub struct HttpRosterSource {
    client: reqwest::Client,
    station_url: String,
}

impl HttpRosterSource {
    pub fn new(client: reqwest::Client, station_url: impl Into<String>) -> Self {
        Self {
            client,
            station_url: station_url.into(),
        }
    }

    async fn get_json(&self, stage: &'static str, url: &str) -> Result<Value, RosterError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RosterError::Status {
                stage,
                status: status.as_u16(),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl RosterSource for HttpRosterSource {
    async fn fetch(&self) -> Result<Roster, RosterError> {
        let station = self.get_json("station", &self.station_url).await?;
        let expedition_urls = parse_expedition_urls(&station)?;

        let mut builder = RosterBuilder::new();
        for url in &expedition_urls {
            let expedition = self.get_json("expedition", url).await?;
            collect_crew(&expedition, &mut builder)?;
        }
        Ok(builder.build())
    }
}

pub fn parse_expedition_urls(station: &Value) -> Result<Vec<String>, RosterError> {
    let expeditions = station
        .get("active_expeditions")
        .and_then(Value::as_array)
        .ok_or(RosterError::MissingField {
            stage: "station",
            field: "active_expeditions",
        })?;
    expeditions
        .iter()
        .map(|expedition| {
            expedition
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(RosterError::MissingField {
                    stage: "station",
                    field: "url",
                })
        })
        .collect()
}

pub fn collect_crew(expedition: &Value, builder: &mut RosterBuilder) -> Result<(), RosterError> {
    let crew = expedition
        .get("crew")
        .and_then(Value::as_array)
        .ok_or(RosterError::MissingField {
            stage: "expedition",
            field: "crew",
        })?;
    for member in crew {
        let astronaut = member.get("astronaut");
        let Some(name) = astronaut
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let agency = astronaut
            .and_then(|a| a.get("agency"))
            .and_then(|a| a.get("abbrev"))
            .and_then(Value::as_str);
        builder.push(name, agency);
    }
    Ok(())
}

/// Polls once immediately and then on every interval. Failed cycles are
/// logged and leave the monitor's roster alone.
pub fn spawn_roster_poller(
    source: Arc<dyn RosterSource>,
    interval: Duration,
    monitor: MonitorHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match source.fetch().await {
                Ok(roster) => {
                    debug!(event = "roster_fetched", members = roster.len());
                    if !monitor.submit_roster(roster).await {
                        info!(event = "roster_poller_stop", reason = "monitor_closed");
                        return;
                    }
                }
                Err(err) => {
                    warn!(event = "roster_fetch_error", error = %err);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
    use serde_json::json;
    use tankwatch_core::RosterEntry;

    /// Serves a station listing two expeditions from an ephemeral local port
    /// and returns the station URL.
    async fn serve_fixture(second_expedition_status: StatusCode) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let station = json!({
            "active_expeditions": [
                {"url": format!("{base}/expedition/1/")},
                {"url": format!("{base}/expedition/2/")}
            ]
        });
        let app = Router::new()
            .route(
                "/station/",
                get(move || {
                    let station = station.clone();
                    async move { Json(station) }
                }),
            )
            .route(
                "/expedition/1/",
                get(|| async {
                    Json(json!({"crew": [
                        {"astronaut": {"name": "Don Pettit", "agency": {"abbrev": "NASA"}}}
                    ]}))
                }),
            )
            .route(
                "/expedition/2/",
                get(move || async move {
                    if !second_expedition_status.is_success() {
                        return (second_expedition_status, "busy").into_response();
                    }
                    Json(json!({"crew": [
                        {"astronaut": {"name": "Alexey Ovchinin", "agency": {"abbrev": "RFSA"}}}
                    ]}))
                    .into_response()
                }),
            )
            .route("/garbage/", get(|| async { "<html>throttled</html>" }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("{base}/station/")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("client")
    }

    #[tokio::test]
    async fn http_source_follows_expedition_urls() {
        let station_url = serve_fixture(StatusCode::OK).await;
        let roster = HttpRosterSource::new(client(), station_url)
            .fetch()
            .await
            .expect("roster");
        assert_eq!(
            roster.entries(),
            &[
                RosterEntry::new("Don Pettit", "NASA"),
                RosterEntry::new("Alexey Ovchinin", "Roscosmos"),
            ]
        );
    }

    #[tokio::test]
    async fn failed_expedition_fails_the_cycle() {
        let station_url = serve_fixture(StatusCode::SERVICE_UNAVAILABLE).await;
        let err = HttpRosterSource::new(client(), station_url)
            .fetch()
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            RosterError::Status {
                stage: "expedition",
                status: 503
            }
        ));
    }

    #[tokio::test]
    async fn non_json_body_is_an_error() {
        let station_url = serve_fixture(StatusCode::OK).await;
        let garbage_url = station_url.replace("/station/", "/garbage/");
        let err = HttpRosterSource::new(client(), garbage_url)
            .fetch()
            .await
            .expect_err("should fail");
        assert!(matches!(err, RosterError::Http(_)));
    }

    #[test]
    fn station_without_expeditions_field_is_an_error() {
        let err = parse_expedition_urls(&json!({"detail": "Request was throttled."}))
            .expect_err("should fail");
        assert!(matches!(
            err,
            RosterError::MissingField {
                field: "active_expeditions",
                ..
            }
        ));
    }

    #[test]
    fn station_with_empty_expeditions_is_valid() {
        let urls = parse_expedition_urls(&json!({"active_expeditions": []})).expect("urls");
        assert!(urls.is_empty());
    }

    #[test]
    fn station_lists_expedition_urls() {
        let urls = parse_expedition_urls(&json!({
            "id": 4,
            "active_expeditions": [
                {"url": "https://example.test/expedition/1/"},
                {"url": "https://example.test/expedition/2/"}
            ]
        }))
        .expect("urls");
        assert_eq!(
            urls,
            vec![
                "https://example.test/expedition/1/".to_string(),
                "https://example.test/expedition/2/".to_string()
            ]
        );
    }

    #[test]
    fn expedition_without_url_fails_the_whole_station() {
        let err = parse_expedition_urls(&json!({
            "active_expeditions": [
                {"url": "https://example.test/expedition/1/"},
                {"id": 2}
            ]
        }))
        .expect_err("should fail");
        assert!(matches!(
            err,
            RosterError::MissingField {
                stage: "station",
                field: "url"
            }
        ));
    }

    #[test]
    fn crew_is_merged_across_expeditions() {
        let mut builder = RosterBuilder::new();
        collect_crew(
            &json!({"crew": [
                {"astronaut": {"name": "Alexey Ovchinin", "agency": {"abbrev": "RFSA"}}},
                {"astronaut": {"name": "Don Pettit", "agency": {"abbrev": "NASA"}}},
                {"astronaut": {"agency": {"abbrev": "NASA"}}}
            ]}),
            &mut builder,
        )
        .expect("first expedition");
        collect_crew(
            &json!({"crew": [
                {"astronaut": {"name": "Don Pettit", "agency": {"abbrev": "ESA"}}},
                {"astronaut": {"name": "Takuya Onishi"}}
            ]}),
            &mut builder,
        )
        .expect("second expedition");

        let roster = builder.build();
        assert_eq!(
            roster.entries(),
            &[
                RosterEntry::new("Alexey Ovchinin", "Roscosmos"),
                RosterEntry::new("Don Pettit", "NASA"),
                RosterEntry::new("Takuya Onishi", "Unknown"),
            ]
        );
    }

    #[test]
    fn expedition_without_crew_field_is_an_error() {
        let mut builder = RosterBuilder::new();
        let err = collect_crew(&json!({"crew": null}), &mut builder).expect_err("should fail");
        assert!(matches!(err, RosterError::MissingField { field: "crew", .. }));
    }
}
