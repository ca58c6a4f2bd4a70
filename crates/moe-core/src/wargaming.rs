//! Wargaming console API client and the stats-delta result provider.
//!
//! The API does not report per-battle results. Instead the provider anchors
//! each session to the tank's server-side battle count and, after each
//! battle, diffs the cumulative statistics either side of that battle's
//! number. A diff of exactly one battle is that battle's authoritative
//! combined damage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use moe_state::{Session, SessionId, TankId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::correction::CorrectionRequest;
use crate::error::ProviderError;
use crate::providers::ResultProvider;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Console platform; selects the API host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Xbox,
    Ps,
}

impl Platform {
    pub fn base_url(&self) -> &'static str {
        match self {
            Platform::Xbox => "https://api-xbox-console.worldoftanks.com/wotx",
            Platform::Ps => "https://api-ps4-console.worldoftanks.com/wotx",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl<T> Envelope<T> {
    fn into_data(self) -> ProviderResult<Option<T>> {
        if self.status != "ok" {
            let error = self.error.unwrap_or(ApiErrorBody {
                code: 0,
                message: "Unknown API error".into(),
            });
            return Err(ProviderError::Api {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlayerSearchResult {
    pub account_id: u64,
    pub nickname: String,
}

#[derive(Debug, Deserialize)]
struct RawTankStats {
    tank_id: u64,
    #[serde(default)]
    marks_on_gun: Option<u8>,
    #[serde(default)]
    last_battle_time: Option<i64>,
    all: RawAllStats,
}

#[derive(Debug, Deserialize)]
struct RawAllStats {
    #[serde(default)]
    battles: u64,
    #[serde(default)]
    damage_dealt: u64,
    #[serde(default)]
    damage_assisted: u64,
}

#[derive(Debug, Deserialize)]
struct RawVehicle {
    #[serde(default)]
    short_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// Stats snapshots
// ---------------------------------------------------------------------------

/// Cumulative per-tank statistics at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TankStatsSnapshot {
    pub tank_id: u64,
    pub battles: u64,
    pub marks_on_gun: u8,
    pub damage_dealt: u64,
    pub damage_assisted: u64,
    pub last_battle_time: Option<i64>,
}

impl From<RawTankStats> for TankStatsSnapshot {
    fn from(raw: RawTankStats) -> Self {
        Self {
            tank_id: raw.tank_id,
            battles: raw.all.battles,
            marks_on_gun: raw.marks_on_gun.unwrap_or(0),
            damage_dealt: raw.all.damage_dealt,
            damage_assisted: raw.all.damage_assisted,
            last_battle_time: raw.last_battle_time,
        }
    }
}

/// Difference between two snapshots spanning exactly one battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BattleDelta {
    pub damage_dealt: u64,
    pub damage_assisted: u64,
    pub marks_on_gun_before: u8,
    pub marks_on_gun_after: u8,
}

impl BattleDelta {
    pub fn combined(&self) -> u64 {
        self.damage_dealt + self.damage_assisted
    }

    pub fn marks_changed(&self) -> bool {
        self.marks_on_gun_before != self.marks_on_gun_after
    }
}

/// `Some` only when exactly one battle separates the snapshots.
pub fn battle_delta(before: &TankStatsSnapshot, after: &TankStatsSnapshot) -> Option<BattleDelta> {
    if before.tank_id != after.tank_id || after.battles != before.battles + 1 {
        return None;
    }
    Some(BattleDelta {
        damage_dealt: after.damage_dealt.saturating_sub(before.damage_dealt),
        damage_assisted: after.damage_assisted.saturating_sub(before.damage_assisted),
        marks_on_gun_before: before.marks_on_gun,
        marks_on_gun_after: after.marks_on_gun,
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Async client for the WoT console API.
#[derive(Clone)]
pub struct WargamingClient {
    http: reqwest::Client,
    base_url: String,
    application_id: String,
}

impl WargamingClient {
    pub fn new(application_id: impl Into<String>, platform: Platform) -> ProviderResult<Self> {
        Self::with_base_url(application_id, platform.base_url())
    }

    /// Client against an arbitrary API root (mirrors, test servers).
    pub fn with_base_url(
        application_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("moe-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            application_id: application_id.into(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> ProviderResult<Option<T>> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%url, "wargaming API request");
        let envelope: Envelope<T> = self
            .http
            .get(&url)
            .query(params)
            .query(&[("application_id", self.application_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        envelope.into_data()
    }

    pub async fn search_player(
        &self,
        gamertag: &str,
        exact: bool,
    ) -> ProviderResult<Vec<PlayerSearchResult>> {
        let mut params = vec![("search", gamertag.to_string())];
        if exact {
            params.push(("type", "exact".to_string()));
        }
        Ok(self
            .request::<Vec<PlayerSearchResult>>("/account/list/", &params)
            .await?
            .unwrap_or_default())
    }

    /// Account id of an exact gamertag match.
    pub async fn resolve_gamertag(&self, gamertag: &str) -> ProviderResult<Option<u64>> {
        Ok(self
            .search_player(gamertag, true)
            .await?
            .first()
            .map(|p| p.account_id))
    }

    /// Current cumulative stats of one tank, if the player owns it.
    pub async fn tank_stats(
        &self,
        account_id: u64,
        tank_id: TankId,
    ) -> ProviderResult<Option<TankStatsSnapshot>> {
        let params = [
            ("account_id", account_id.to_string()),
            ("tank_id", tank_id.0.to_string()),
        ];
        let data = self
            .request::<HashMap<String, Option<Vec<RawTankStats>>>>("/tanks/stats/", &params)
            .await?
            .unwrap_or_default();
        Ok(data
            .into_iter()
            .find(|(key, _)| *key == account_id.to_string())
            .and_then(|(_, tanks)| tanks)
            .and_then(|tanks| tanks.into_iter().find(|t| t.tank_id == tank_id.0))
            .map(TankStatsSnapshot::from))
    }

    /// Display name of a vehicle.
    pub async fn vehicle_name(&self, tank_id: TankId) -> ProviderResult<Option<String>> {
        let params = [("tank_id", tank_id.0.to_string())];
        let data = self
            .request::<HashMap<String, Option<RawVehicle>>>("/encyclopedia/vehicles/", &params)
            .await?
            .unwrap_or_default();
        Ok(data
            .get(&tank_id.0.to_string())
            .and_then(|v| v.as_ref())
            .and_then(|v| v.short_name.clone().or_else(|| v.name.clone())))
    }
}

// ---------------------------------------------------------------------------
// Result provider
// ---------------------------------------------------------------------------

/// Stat snapshots kept per observed battle count.
const SEEN_SNAPSHOTS: usize = 32;

/// Where a session's battles sit in the tank's server-side battle count.
#[derive(Debug, Clone)]
struct Anchor {
    session_id: SessionId,
    /// Server battle count before the session's first battle.
    battles: u64,
}

#[derive(Debug, Default)]
struct StatsHistory {
    anchor: Option<Anchor>,
    seen: BTreeMap<u64, TankStatsSnapshot>,
}

impl StatsHistory {
    fn record(&mut self, snapshot: TankStatsSnapshot) {
        self.seen.insert(snapshot.battles, snapshot);
        while self.seen.len() > SEEN_SNAPSHOTS {
            self.seen.pop_first();
        }
    }
}

/// Authoritative battle results from cumulative stat deltas.
///
/// Battle `seq` of a session is the server's battle number
/// `anchor + seq`, so its result is the diff between the snapshots seen at
/// `anchor + seq - 1` and `anchor + seq`. A battle whose stats never show
/// up does not shift the numbering of the ones after it.
pub struct WargamingResultProvider {
    client: WargamingClient,
    account_id: u64,
    history: Mutex<StatsHistory>,
}

impl WargamingResultProvider {
    pub fn new(client: WargamingClient, account_id: u64) -> Self {
        Self {
            client,
            account_id,
            history: Mutex::new(StatsHistory::default()),
        }
    }

    /// Server battle count the current session is anchored to.
    pub async fn anchor(&self) -> Option<u64> {
        self.history.lock().await.anchor.as_ref().map(|a| a.battles)
    }

    async fn current(&self, tank_id: TankId) -> ProviderResult<TankStatsSnapshot> {
        self.client
            .tank_stats(self.account_id, tank_id)
            .await?
            .ok_or_else(|| {
                ProviderError::Unavailable(format!(
                    "no statistics for tank {} on account {}",
                    tank_id, self.account_id
                ))
            })
    }
}

#[async_trait]
impl ResultProvider for WargamingResultProvider {
    async fn prepare(&self, session: &Session, closed_battles: u32) -> ProviderResult<Option<u64>> {
        let snapshot = self.current(session.tank_id).await?;
        // Without a recorded anchor, assume the server already counts every logged battle.
        let battles = session
            .stats_baseline
            .unwrap_or_else(|| snapshot.battles.saturating_sub(u64::from(closed_battles)));
        info!(
            tank_id = %session.tank_id,
            battles = snapshot.battles,
            anchor = battles,
            marks_on_gun = snapshot.marks_on_gun,
            "stats baseline captured"
        );

        let mut history = self.history.lock().await;
        history.seen.clear();
        history.record(snapshot);
        history.anchor = Some(Anchor {
            session_id: session.session_id.clone(),
            battles,
        });
        Ok(Some(battles))
    }

    async fn fetch(&self, request: &CorrectionRequest) -> ProviderResult<u64> {
        let current = self.current(request.tank_id).await?;
        let mut history = self.history.lock().await;

        // The session is still being prepared.
        let Some(anchor) = history
            .anchor
            .as_ref()
            .filter(|a| a.session_id == request.session_id)
            .map(|a| a.battles)
        else {
            return Err(ProviderError::NotReady);
        };
        history.record(current);

        let expected = anchor + u64::from(request.seq.max(1));
        if current.battles < expected {
            return Err(ProviderError::NotReady);
        }

        let before = history.seen.get(&(expected - 1));
        let after = history.seen.get(&expected);
        let Some(delta) = before
            .zip(after)
            .and_then(|(before, after)| battle_delta(before, after))
        else {
            return Err(ProviderError::Unavailable(format!(
                "stats moved to {} battles before battle {} could be isolated",
                current.battles, expected
            )));
        };

        debug!(
            battle_id = %request.battle_id,
            server_battle = expected,
            dealt = delta.damage_dealt,
            assisted = delta.damage_assisted,
            "authoritative delta"
        );
        if delta.marks_changed() {
            info!(
                tank_id = %request.tank_id,
                marks_on_gun = delta.marks_on_gun_after,
                "marks on gun changed"
            );
        }
        Ok(delta.combined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};
    use moe_state::BattleId;
    use serde_json::json;

    fn snapshot(battles: u64, dealt: u64, assisted: u64, marks: u8) -> TankStatsSnapshot {
        TankStatsSnapshot {
            tank_id: 42,
            battles,
            marks_on_gun: marks,
            damage_dealt: dealt,
            damage_assisted: assisted,
            last_battle_time: None,
        }
    }

    fn stats_body(battles: u64, dealt: u64, assisted: u64) -> serde_json::Value {
        json!({
            "status": "ok",
            "data": {
                "1001": [{
                    "tank_id": 42,
                    "marks_on_gun": 2,
                    "last_battle_time": 1_700_000_000,
                    "all": {
                        "battles": battles,
                        "damage_dealt": dealt,
                        "damage_assisted": assisted
                    }
                }]
            }
        })
    }

    fn request(session: &Session, seq: u32) -> CorrectionRequest {
        CorrectionRequest {
            battle_id: BattleId::new(),
            session_id: session.session_id.clone(),
            tank_id: session.tank_id,
            seq,
        }
    }

    async fn serve_stats(
        server: &MockServer,
        battles: u64,
        dealt: u64,
        assisted: u64,
    ) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tanks/stats/");
                then.status(200).json_body(stats_body(battles, dealt, assisted));
            })
            .await
    }

    fn provider(server: &MockServer) -> WargamingResultProvider {
        let client = WargamingClient::with_base_url("demo", server.base_url()).unwrap();
        WargamingResultProvider::new(client, 1001)
    }

    #[test]
    fn delta_of_single_battle() {
        let delta = battle_delta(
            &snapshot(100, 400_000, 100_000, 2),
            &snapshot(101, 403_500, 100_800, 2),
        )
        .unwrap();
        assert_eq!(delta.damage_dealt, 3500);
        assert_eq!(delta.damage_assisted, 800);
        assert_eq!(delta.combined(), 4300);
        assert!(!delta.marks_changed());
    }

    #[test]
    fn delta_tracks_mark_change() {
        let delta = battle_delta(
            &snapshot(100, 400_000, 100_000, 2),
            &snapshot(101, 405_000, 101_500, 3),
        )
        .unwrap();
        assert!(delta.marks_changed());
        assert_eq!(delta.marks_on_gun_after, 3);
    }

    #[test]
    fn delta_requires_exactly_one_battle() {
        let before = snapshot(100, 400_000, 100_000, 2);
        assert!(battle_delta(&before, &snapshot(103, 412_000, 103_000, 2)).is_none());
        assert!(battle_delta(&before, &before).is_none());
    }

    #[test]
    fn error_envelope_maps_to_api_error() {
        let envelope: Envelope<serde_json::Value> = serde_json::from_value(json!({
            "status": "error",
            "error": {"code": 407, "message": "INVALID_APPLICATION_ID", "field": "application_id"}
        }))
        .unwrap();
        match envelope.into_data() {
            Err(ProviderError::Api { code, message }) => {
                assert_eq!(code, 407);
                assert_eq!(message, "INVALID_APPLICATION_ID");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[test]
    fn platform_hosts() {
        assert!(Platform::Xbox.base_url().contains("api-xbox-console"));
        assert!(Platform::Ps.base_url().contains("api-ps4-console"));
    }

    #[tokio::test]
    async fn resolves_gamertag() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/account/list/")
                    .query_param("search", "Tanker")
                    .query_param("type", "exact")
                    .query_param("application_id", "demo");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "data": [{"account_id": 1001, "nickname": "Tanker"}]
                }));
            })
            .await;

        let client = WargamingClient::with_base_url("demo", server.base_url()).unwrap();
        assert_eq!(client.resolve_gamertag("Tanker").await.unwrap(), Some(1001));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reads_tank_stats_and_vehicle_name() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tanks/stats/").query_param("account_id", "1001");
                then.status(200).json_body(stats_body(100, 400_000, 120_000));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/encyclopedia/vehicles/");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "data": {"42": {"short_name": "T-54", "tier": 9}}
                }));
            })
            .await;

        let client = WargamingClient::with_base_url("demo", server.base_url()).unwrap();
        let stats = client.tank_stats(1001, TankId(42)).await.unwrap().unwrap();
        assert_eq!(stats.battles, 100);
        assert_eq!(stats.damage_assisted, 120_000);
        assert_eq!(stats.marks_on_gun, 2);
        assert_eq!(
            client.vehicle_name(TankId(42)).await.unwrap().as_deref(),
            Some("T-54")
        );
    }

    #[tokio::test]
    async fn api_error_is_not_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/account/list/");
                then.status(200).json_body(json!({
                    "status": "error",
                    "error": {"code": 407, "message": "INVALID_APPLICATION_ID"}
                }));
            })
            .await;

        let client = WargamingClient::with_base_url("bad", server.base_url()).unwrap();
        let err = client.search_player("Tanker", true).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn provider_reports_not_ready_then_delta() {
        let server = MockServer::start_async().await;
        let mut stats = serve_stats(&server, 100, 400_000, 100_000).await;

        let provider = provider(&server);
        let session = Session::new(TankId(42), "T-54");
        assert_eq!(provider.prepare(&session, 0).await.unwrap(), Some(100));

        let req = request(&session, 1);
        assert!(matches!(
            provider.fetch(&req).await,
            Err(ProviderError::NotReady)
        ));

        stats.delete_async().await;
        serve_stats(&server, 101, 403_500, 100_800).await;

        assert_eq!(provider.fetch(&req).await.unwrap(), 4300);
        assert_eq!(provider.anchor().await, Some(100));
    }

    #[tokio::test]
    async fn late_stats_stay_with_their_own_battle() {
        let server = MockServer::start_async().await;
        let mut stats = serve_stats(&server, 100, 400_000, 100_000).await;

        let provider = provider(&server);
        let session = Session::new(TankId(42), "T-54");
        provider.prepare(&session, 0).await.unwrap();

        // Battle 1 gave up while the server still showed 100 battles.
        assert!(matches!(
            provider.fetch(&request(&session, 1)).await,
            Err(ProviderError::NotReady)
        ));

        // Battle 1's stats land while battle 2 is being corrected.
        stats.delete_async().await;
        stats = serve_stats(&server, 101, 401_000, 100_300).await;
        let second = request(&session, 2);
        assert!(matches!(
            provider.fetch(&second).await,
            Err(ProviderError::NotReady)
        ));

        stats.delete_async().await;
        serve_stats(&server, 102, 403_000, 100_800).await;
        assert_eq!(provider.fetch(&second).await.unwrap(), 2500);
    }

    #[tokio::test]
    async fn recorded_baseline_survives_restart() {
        let server = MockServer::start_async().await;
        // One logged battle has not reached the server yet.
        let mut stats = serve_stats(&server, 100, 400_000, 100_000).await;

        let provider = provider(&server);
        let mut session = Session::new(TankId(42), "T-54");
        session.stats_baseline = Some(100);
        assert_eq!(provider.prepare(&session, 1).await.unwrap(), Some(100));

        stats.delete_async().await;
        stats = serve_stats(&server, 101, 401_000, 100_300).await;
        let second = request(&session, 2);
        assert!(matches!(
            provider.fetch(&second).await,
            Err(ProviderError::NotReady)
        ));

        stats.delete_async().await;
        serve_stats(&server, 102, 402_200, 100_500).await;
        assert_eq!(provider.fetch(&second).await.unwrap(), 1400);
    }

    #[tokio::test]
    async fn unrecorded_baseline_counts_logged_battles_as_seen() {
        let server = MockServer::start_async().await;
        serve_stats(&server, 103, 412_000, 103_000).await;

        let provider = provider(&server);
        let session = Session::new(TankId(42), "T-54");
        assert_eq!(provider.prepare(&session, 3).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn provider_gives_up_when_several_battles_elapsed() {
        let server = MockServer::start_async().await;
        let mut stats = serve_stats(&server, 100, 400_000, 100_000).await;

        let provider = provider(&server);
        let session = Session::new(TankId(42), "T-54");
        provider.prepare(&session, 0).await.unwrap();

        stats.delete_async().await;
        serve_stats(&server, 103, 412_000, 103_000).await;

        let err = provider.fetch(&request(&session, 1)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn fetch_before_prepare_is_not_ready() {
        let server = MockServer::start_async().await;
        serve_stats(&server, 100, 400_000, 100_000).await;

        let provider = provider(&server);
        let session = Session::new(TankId(42), "T-54");
        assert!(matches!(
            provider.fetch(&request(&session, 1)).await,
            Err(ProviderError::NotReady)
        ));
    }
}
