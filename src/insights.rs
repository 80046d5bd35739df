//! C8 — insight snapshot builder. No teacher analogue runs this
//! incrementally; the window-bucketing shape here generalizes
//! `model::rating_tracker::RatingTracker::get_rating_history`'s "walk a
//! player's ordered rating history" access pattern into the several
//! summaries a player insights view needs.

use crate::error::DomainError;
use crate::store::types::{LadderId, OrganizationId, PlayerId, RatingEventRow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingTrendPoint {
    pub period_start: DateTime<Utc>,
    pub mu: f64,
    pub sigma: f64,
    pub mu_delta: f64,
    pub sample_count: u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingTrend {
    pub cadence: Cadence,
    pub points: Vec<RatingTrendPoint>,
    pub lifetime_high: f64,
    pub lifetime_low: f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormWindow {
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
    pub net_delta: f64,
    pub avg_delta: f64,
    pub avg_opponent_mu: f64,
    pub last_event_at: Option<DateTime<Utc>>
}

impl FormWindow {
    fn empty() -> Self {
        FormWindow { matches: 0, wins: 0, losses: 0, net_delta: 0.0, avg_delta: 0.0, avg_opponent_mu: 0.0, last_event_at: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormSummary {
    pub d7: FormWindow,
    pub d30: FormWindow,
    pub d90: FormWindow,
    pub d365: FormWindow
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisciplineOverview {
    pub sport: String,
    pub discipline: String,
    pub mu: f64,
    pub sigma: f64,
    pub matches_played: u32,
    /// 1-based leaderboard position right now. `None` when built from raw
    /// history alone ([`build_snapshot`]) without store access to query the
    /// leaderboard; filled in by [`build_snapshot_for_player`].
    pub current_rank: Option<u32>,
    /// Rank a player's lifetime-high mu in this discipline would occupy on
    /// the current leaderboard — an approximation, since per-event ranks
    /// aren't persisted historically. Same `None` caveat as `current_rank`.
    pub best_rank: Option<u32>
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volatility {
    pub current_sigma: f64,
    pub sigma_change_30d: f64,
    pub inactivity_days: i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKeys {
    pub digest: String,
    pub etag: String
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInsightsSnapshot {
    pub organization_id: OrganizationId,
    pub player_id: PlayerId,
    pub rating_trend: RatingTrend,
    pub form_summary: FormSummary,
    pub discipline_overview: Vec<DisciplineOverview>,
    pub milestones: Vec<String>,
    pub streak: i32,
    pub volatility: Volatility,
    pub cache_keys: CacheKeys
}

/// Builds the full insight snapshot for one player. `history` must already be sorted ascending by
/// `applied_at` ([`crate::store::RatingStore::player_history`] guarantees
/// this); `now` is the snapshot's reference instant.
pub fn build_snapshot(
    organization_id: OrganizationId,
    player_id: PlayerId,
    history: &[RatingEventRow],
    now: DateTime<Utc>
) -> PlayerInsightsSnapshot {
    let rating_trend = build_rating_trend(history);
    let form_summary = FormSummary {
        d7: form_window(history, now, Duration::days(7)),
        d30: form_window(history, now, Duration::days(30)),
        d90: form_window(history, now, Duration::days(90)),
        d365: form_window(history, now, Duration::days(365))
    };
    let discipline_overview = build_discipline_overview(history);
    let milestones = build_milestones(history);
    let streak = build_streak(history);
    let volatility = build_volatility(history, now);

    let mut snapshot = PlayerInsightsSnapshot {
        organization_id,
        player_id,
        rating_trend,
        form_summary,
        discipline_overview,
        milestones,
        streak,
        volatility,
        cache_keys: CacheKeys { digest: String::new(), etag: String::new() }
    };

    let digest = stable_digest(&snapshot);
    snapshot.cache_keys = CacheKeys { digest: digest.clone(), etag: digest };
    snapshot
}

/// Reads the full rating history for `(organization_id, player_id)` and
/// builds its snapshot. `now` is supplied by the caller (no wall-clock
/// reads inside this crate, per the determinism invariant C3 also follows).
pub async fn build_snapshot_for_player<S: crate::store::RatingStore>(
    store: &S,
    organization_id: OrganizationId,
    player_id: PlayerId,
    now: DateTime<Utc>
) -> Result<PlayerInsightsSnapshot, DomainError> {
    let history = store.player_history(&organization_id, &player_id).await?;
    let mut snapshot = build_snapshot(organization_id, player_id.clone(), &history, now);

    for overview in &mut snapshot.discipline_overview {
        if let Some((ladder_id, peak_mu)) = discipline_ladder_and_peak(&history, &overview.sport, &overview.discipline) {
            overview.current_rank = store.get_player_rank(&ladder_id, &player_id).await?;
            overview.best_rank = Some(store.rank_for_mu(&ladder_id, peak_mu).await?);
        }
    }

    let digest = stable_digest(&snapshot);
    snapshot.cache_keys = CacheKeys { digest: digest.clone(), etag: digest };
    Ok(snapshot)
}

/// The ladder a discipline's latest event came from, and the highest `mu`
/// ever reached on it — recomputed from `history` rather than carried out of
/// `build_discipline_overview` so that function stays a pure rollup.
fn discipline_ladder_and_peak(history: &[RatingEventRow], sport: &str, discipline: &str) -> Option<(LadderId, f64)> {
    let mut ladder_id = None;
    let mut peak = f64::MIN;
    for event in history {
        let (s, d) = parse_ladder_key(&event.ladder_id.0);
        if s == sport && d == discipline {
            ladder_id = Some(event.ladder_id.clone());
            peak = peak.max(event.mu_after);
        }
    }
    ladder_id.map(|l| (l, peak))
}

fn build_rating_trend(history: &[RatingEventRow]) -> RatingTrend {
    let mut points: Vec<RatingTrendPoint> = Vec::new();
    let mut lifetime_high = f64::MIN;
    let mut lifetime_low = f64::MAX;

    for event in history {
        lifetime_high = lifetime_high.max(event.mu_after);
        lifetime_low = lifetime_low.min(event.mu_after);

        let period_start = event.applied_at.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        if let Some(last) = points.last_mut() {
            if last.period_start == period_start {
                last.mu = event.mu_after;
                last.sigma = event.sigma_after;
                last.mu_delta += event.delta;
                last.sample_count += 1;
                continue;
            }
        }
        points.push(RatingTrendPoint {
            period_start,
            mu: event.mu_after,
            sigma: event.sigma_after,
            mu_delta: event.delta,
            sample_count: 1
        });
    }

    if history.is_empty() {
        lifetime_high = 0.0;
        lifetime_low = 0.0;
    }

    RatingTrend { cadence: Cadence::Daily, points, lifetime_high, lifetime_low }
}

fn form_window(history: &[RatingEventRow], now: DateTime<Utc>, window: Duration) -> FormWindow {
    let cutoff = now - window;
    let in_window: Vec<&RatingEventRow> = history.iter().filter(|e| e.applied_at > cutoff && e.applied_at <= now).collect();
    if in_window.is_empty() {
        return FormWindow::empty();
    }

    let matches = in_window.len() as u32;
    let wins = in_window.iter().filter(|e| e.delta > 0.0).count() as u32;
    let losses = in_window.iter().filter(|e| e.delta < 0.0).count() as u32;
    let net_delta: f64 = in_window.iter().map(|e| e.delta).sum();
    let avg_delta = net_delta / matches as f64;
    let avg_opponent_mu: f64 = in_window.iter().map(|e| e.opponent_mu_before).sum::<f64>() / matches as f64;
    let last_event_at = in_window.iter().map(|e| e.applied_at).max();

    FormWindow { matches, wins, losses, net_delta, avg_delta, avg_opponent_mu, last_event_at }
}

fn build_discipline_overview(history: &[RatingEventRow]) -> Vec<DisciplineOverview> {
    use std::collections::BTreeMap;
    let mut latest: BTreeMap<(String, String), (f64, f64, u32)> = BTreeMap::new();

    for event in history {
        let (sport, discipline) = parse_ladder_key(&event.ladder_id.0);
        let entry = latest.entry((sport, discipline)).or_insert((0.0, 0.0, 0));
        entry.0 = event.mu_after;
        entry.1 = event.sigma_after;
        entry.2 += 1;
    }

    latest
        .into_iter()
        .map(|((sport, discipline), (mu, sigma, matches_played))| DisciplineOverview {
            sport,
            discipline,
            mu,
            sigma,
            matches_played,
            current_rank: None,
            best_rank: None
        })
        .collect()
}

/// `ladder_id` is built by the store as
/// `organization_id/sport/discipline/format/tier/region_id` (see
/// `store::memory::MemoryStore::ladder_key_str` /
/// `store::postgres::PostgresStore::get_or_create_ladder`).
fn parse_ladder_key(ladder_id: &str) -> (String, String) {
    let parts: Vec<&str> = ladder_id.splitn(6, '/').collect();
    match (parts.get(1), parts.get(2)) {
        (Some(sport), Some(discipline)) => (sport.to_string(), discipline.to_string()),
        _ => ("UNKNOWN".to_string(), "UNKNOWN".to_string())
    }
}

fn build_milestones(history: &[RatingEventRow]) -> Vec<String> {
    let mut milestones = Vec::new();
    let mut crossed_hundreds: std::collections::BTreeSet<i64> = std::collections::BTreeSet::new();
    for event in history {
        let bucket = (event.mu_after / 100.0).floor() as i64;
        if event.delta > 0.0 && crossed_hundreds.insert(bucket) && bucket > 0 {
            milestones.push(format!("crossed {} rating", bucket * 100));
        }
    }
    milestones
}

/// Positive = current winning streak length, negative = current losing
/// streak length, 0 if there is no history.
fn build_streak(history: &[RatingEventRow]) -> i32 {
    let mut streak = 0i32;
    for event in history.iter().rev() {
        let won = event.delta > 0.0;
        if streak == 0 {
            streak = if won { 1 } else { -1 };
        } else if (streak > 0) == won {
            streak += if won { 1 } else { -1 };
        } else {
            break;
        }
    }
    streak
}

fn build_volatility(history: &[RatingEventRow], now: DateTime<Utc>) -> Volatility {
    let current_sigma = history.last().map(|e| e.sigma_after).unwrap_or(0.0);
    let cutoff = now - Duration::days(30);
    let sigma_30d_ago = history.iter().rev().find(|e| e.applied_at <= cutoff).map(|e| e.sigma_after).unwrap_or(current_sigma);
    let inactivity_days = history.last().map(|e| (now - e.applied_at).num_days()).unwrap_or(0);

    Volatility {
        current_sigma,
        sigma_change_30d: current_sigma - sigma_30d_ago,
        inactivity_days
    }
}

/// `stable_hash(snapshot_without_meta)`: hashes a JSON
/// encoding of everything but `cache_keys` itself.
fn stable_digest(snapshot: &PlayerInsightsSnapshot) -> String {
    #[derive(Serialize)]
    struct WithoutMeta<'a> {
        organization_id: &'a OrganizationId,
        player_id: &'a PlayerId,
        rating_trend: &'a RatingTrend,
        form_summary: &'a FormSummary,
        discipline_overview: &'a [DisciplineOverview],
        milestones: &'a [String],
        streak: i32,
        volatility: &'a Volatility
    }

    let without_meta = WithoutMeta {
        organization_id: &snapshot.organization_id,
        player_id: &snapshot.player_id,
        rating_trend: &snapshot.rating_trend,
        form_summary: &snapshot.form_summary,
        discipline_overview: &snapshot.discipline_overview,
        milestones: &snapshot.milestones,
        streak: snapshot.streak,
        volatility: &snapshot.volatility
    };

    let bytes = serde_json::to_vec(&without_meta).expect("snapshot is always serializable");
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
