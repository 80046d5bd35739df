//! Production `RatingStore`: raw `tokio_postgres` queries, no ORM, manual
//! row decoding. `connect_with_retry` backs off with a doubling delay capped
//! at a max, so the worker and migration binaries can start before Postgres
//! is reachable.

use super::types::{
    GameScoreLine, Ladder, LadderId, LadderKey, Match, MatchId, Organization, OrganizationId, PairKey, PairSynergy,
    Player, PlayerId, PlayerRating, RatingEventId, RatingEventRow, RatingState, RatingStatus, ReplayQueueEntry
};
use super::LeaderboardCursor;
use crate::error::DomainError;
use crate::rating::UpdateOutcome;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

pub struct PostgresStore {
    client: Arc<Client>
}

impl PostgresStore {
    pub async fn connect(connection_str: &str) -> Result<Self, DomainError> {
        let (client, connection) = tokio_postgres::connect(connection_str, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection task terminated");
            }
        });

        Ok(PostgresStore { client: Arc::new(client) })
    }

    /// Connects with exponential backoff, starting at `initial_delay` and
    /// doubling up to `max_delay`, giving up after `max_attempts`.
    pub async fn connect_with_retry(
        connection_str: &str,
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration
    ) -> Result<Self, DomainError> {
        let mut attempt = 0;
        let mut delay = initial_delay;

        loop {
            attempt += 1;
            match Self::connect(connection_str).await {
                Ok(store) => return Ok(store),
                Err(e) => {
                    if attempt >= max_attempts {
                        tracing::error!(attempt, error = %e, "failed to connect to postgres, giving up");
                        return Err(e);
                    }
                    tracing::warn!(attempt, max_attempts, delay = ?delay, error = %e, "postgres connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, max_delay);
                }
            }
        }
    }

    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }
}

impl super::RatingStore for PostgresStore {
    async fn get_organization(&self, organization_id: &OrganizationId) -> Result<Option<Organization>, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT organization_id, slug FROM organizations WHERE organization_id = $1",
                &[&organization_id.0]
            )
            .await?;
        Ok(row.map(|r| Organization { organization_id: OrganizationId(r.get("organization_id")), slug: r.get("slug") }))
    }

    async fn get_players(
        &self,
        organization_id: &OrganizationId,
        player_ids: &[PlayerId]
    ) -> Result<Vec<Player>, DomainError> {
        let ids: Vec<&str> = player_ids.iter().map(|p| p.0.as_str()).collect();
        let rows = self
            .client
            .query(
                "SELECT player_id, organization_id, display_name, given_name, family_name, \
                 birth_date, birth_year, country_code, region_id, external_ref \
                 FROM players WHERE organization_id = $1 AND player_id = ANY($2)",
                &[&organization_id.0, &ids]
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| Player {
                player_id: PlayerId(r.get("player_id")),
                organization_id: OrganizationId(r.get("organization_id")),
                display_name: r.get("display_name"),
                given_name: r.get("given_name"),
                family_name: r.get("family_name"),
                sex: None,
                birth_date: r.get("birth_date"),
                birth_year: r.get("birth_year"),
                country_code: r.get("country_code"),
                region_id: r.get::<_, Option<String>>("region_id").map(|s| super::types::RegionId(s)),
                external_ref: r.get("external_ref")
            })
            .collect())
    }

    async fn get_players_any_organization(&self, player_ids: &[PlayerId]) -> Result<Vec<Player>, DomainError> {
        let ids: Vec<&str> = player_ids.iter().map(|p| p.0.as_str()).collect();
        let rows = self
            .client
            .query(
                "SELECT player_id, organization_id, display_name, given_name, family_name, \
                 birth_date, birth_year, country_code, region_id, external_ref \
                 FROM players WHERE player_id = ANY($1)",
                &[&ids]
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| Player {
                player_id: PlayerId(r.get("player_id")),
                organization_id: OrganizationId(r.get("organization_id")),
                display_name: r.get("display_name"),
                given_name: r.get("given_name"),
                family_name: r.get("family_name"),
                sex: None,
                birth_date: r.get("birth_date"),
                birth_year: r.get("birth_year"),
                country_code: r.get("country_code"),
                region_id: r.get::<_, Option<String>>("region_id").map(|s| super::types::RegionId(s)),
                external_ref: r.get("external_ref")
            })
            .collect())
    }

    async fn get_or_create_ladder(&self, key: &LadderKey) -> Result<Ladder, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT ladder_id FROM rating_ladders \
                 WHERE organization_id = $1 AND sport = $2 AND discipline = $3 \
                 AND format = $4 AND tier = $5 AND region_id = $6",
                &[&key.organization_id.0, &key.sport, &key.discipline, &key.format, &key.tier, &key.region_id.0]
            )
            .await?;

        if let Some(row) = row {
            let ladder_id: String = row.get("ladder_id");
            return Ok(Ladder { ladder_id: LadderId(ladder_id), key: key.clone(), age_policy: None });
        }

        let ladder_id = LadderId(format!(
            "{}/{}/{}/{}/{}/{}",
            key.organization_id, key.sport, key.discipline, key.format, key.tier, key.region_id
        ));
        self.client
            .execute(
                "INSERT INTO rating_ladders (ladder_id, organization_id, sport, discipline, format, tier, region_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (ladder_id) DO NOTHING",
                &[
                    &ladder_id.0,
                    &key.organization_id.0,
                    &key.sport,
                    &key.discipline,
                    &key.format,
                    &key.tier,
                    &key.region_id.0
                ]
            )
            .await?;

        Ok(Ladder { ladder_id, key: key.clone(), age_policy: None })
    }

    async fn get_ratings(
        &self,
        ladder_id: &LadderId,
        player_ids: &[PlayerId]
    ) -> Result<BTreeMap<PlayerId, RatingState>, DomainError> {
        let ids: Vec<&str> = player_ids.iter().map(|p| p.0.as_str()).collect();
        let rows = self
            .client
            .query(
                "SELECT player_id, mu, sigma, matches_count FROM player_ratings \
                 WHERE ladder_id = $1 AND player_id = ANY($2)",
                &[&ladder_id.0, &ids]
            )
            .await?;

        let mut found: BTreeMap<PlayerId, RatingState> = rows
            .iter()
            .map(|r| {
                let player_id = PlayerId(r.get("player_id"));
                let state = RatingState {
                    mu: r.get("mu"),
                    sigma: r.get("sigma"),
                    matches_count: r.get::<_, i32>("matches_count") as u32
                };
                (player_id, state)
            })
            .collect();

        for id in player_ids {
            found.entry(id.clone()).or_insert_with(|| RatingState::baseline(&crate::params::RatingParameters::default()));
        }
        Ok(found)
    }

    async fn get_pair_synergies(
        &self,
        ladder_id: &LadderId,
        pairs: &[PairKey]
    ) -> Result<BTreeMap<PairKey, PairSynergy>, DomainError> {
        let mut out = BTreeMap::new();
        for pair in pairs {
            let row = self
                .client
                .query_opt(
                    "SELECT gamma, matches FROM pair_synergies \
                     WHERE ladder_id = $1 AND player_id_a = $2 AND player_id_b = $3",
                    &[&ladder_id.0, &pair.0 .0, &pair.1 .0]
                )
                .await?;
            let synergy = match row {
                Some(r) => PairSynergy { gamma: r.get("gamma"), matches: r.get::<_, i32>("matches") as u32 },
                None => PairSynergy::default()
            };
            out.insert(pair.clone(), synergy);
        }
        Ok(out)
    }

    async fn record_rated_match(
        &self,
        ladder_id: &LadderId,
        organization_id: &OrganizationId,
        match_id: MatchId,
        applied_at: DateTime<Utc>,
        mov_weight: f64,
        outcome: &UpdateOutcome
    ) -> Result<Vec<RatingEventRow>, DomainError> {
        let mut events = Vec::with_capacity(outcome.per_player.len());

        for (player_id, delta) in &outcome.per_player {
            self.client
                .execute(
                    "INSERT INTO player_ratings (player_id, ladder_id, mu, sigma, matches_count) \
                     VALUES ($1, $2, $3, $4, 1) \
                     ON CONFLICT (player_id, ladder_id) DO UPDATE \
                     SET mu = $3, sigma = $4, matches_count = player_ratings.matches_count + 1",
                    &[&player_id.0, &ladder_id.0, &delta.mu_after, &delta.sigma_after]
                )
                .await?;

            let rating_event_id = RatingEventId::new();
            self.client
                .execute(
                    "INSERT INTO player_rating_history \
                     (rating_event_id, organization_id, player_id, ladder_id, match_id, applied_at, \
                      mu_before, mu_after, delta, sigma_before, sigma_after, win_probability_pre, \
                      opponent_mu_before, mov_weight) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                    &[
                        &rating_event_id.0,
                        &organization_id.0,
                        &player_id.0,
                        &ladder_id.0,
                        &match_id.0,
                        &applied_at,
                        &delta.mu_before,
                        &delta.mu_after,
                        &delta.delta,
                        &delta.sigma_before,
                        &delta.sigma_after,
                        &delta.win_probability_pre,
                        &delta.opponent_mu_before,
                        &mov_weight
                    ]
                )
                .await?;

            events.push(RatingEventRow {
                rating_event_id,
                organization_id: organization_id.clone(),
                player_id: player_id.clone(),
                ladder_id: ladder_id.clone(),
                match_id,
                applied_at,
                mu_before: delta.mu_before,
                mu_after: delta.mu_after,
                delta: delta.delta,
                sigma_before: delta.sigma_before,
                sigma_after: delta.sigma_after,
                win_probability_pre: delta.win_probability_pre,
                opponent_mu_before: delta.opponent_mu_before,
                mov_weight
            });
        }

        for (pair_key, pair_delta) in &outcome.pair_updates {
            self.client
                .execute(
                    "INSERT INTO pair_synergies (ladder_id, player_id_a, player_id_b, gamma, matches) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (ladder_id, player_id_a, player_id_b) DO UPDATE \
                     SET gamma = $4, matches = $5",
                    &[&ladder_id.0, &pair_key.0 .0, &pair_key.1 .0, &pair_delta.gamma_after, &(pair_delta.matches_after as i32)]
                )
                .await?;

            self.client
                .execute(
                    "INSERT INTO pair_synergy_history \
                     (pair_synergy_history_id, ladder_id, player_id_a, player_id_b, match_id, applied_at, \
                      gamma_before, gamma_after, matches_before, matches_after, activated) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                    &[
                        &super::types::PairSynergyHistoryId::new().0,
                        &ladder_id.0,
                        &pair_key.0 .0,
                        &pair_key.1 .0,
                        &match_id.0,
                        &applied_at,
                        &pair_delta.gamma_before,
                        &pair_delta.gamma_after,
                        &(pair_delta.matches_before as i32),
                        &(pair_delta.matches_after as i32),
                        &pair_delta.activated
                    ]
                )
                .await?;
        }

        Ok(events)
    }

    async fn get_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<Option<ReplayQueueEntry>, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT ladder_id, earliest_start_time, created_at, updated_at \
                 FROM rating_replay_queue WHERE ladder_id = $1",
                &[&ladder_id.0]
            )
            .await?;
        Ok(row.map(|r| ReplayQueueEntry {
            ladder_id: LadderId(r.get("ladder_id")),
            earliest_start_time: r.get("earliest_start_time"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at")
        }))
    }

    async fn upsert_replay_queue_entry(
        &self,
        ladder_id: &LadderId,
        earliest_start_time: DateTime<Utc>
    ) -> Result<(), DomainError> {
        self.client
            .execute(
                "INSERT INTO rating_replay_queue (ladder_id, earliest_start_time, created_at, updated_at) \
                 VALUES ($1, $2, now(), now()) \
                 ON CONFLICT (ladder_id) DO UPDATE \
                 SET earliest_start_time = LEAST(rating_replay_queue.earliest_start_time, $2), updated_at = now()",
                &[&ladder_id.0, &earliest_start_time]
            )
            .await?;
        Ok(())
    }

    async fn delete_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<(), DomainError> {
        self.client.execute("DELETE FROM rating_replay_queue WHERE ladder_id = $1", &[&ladder_id.0]).await?;
        Ok(())
    }

    async fn matches_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<Vec<Match>, DomainError> {
        let rows = self
            .client
            .query(
                "SELECT match_id, ladder_id, provider_id, organization_id, start_time, tier, sport, \
                 discipline, format, side_a, side_b, raw_payload, rating_status, rating_skip_reason, \
                 event_id, competition_id, external_ref, venue_id, region_id \
                 FROM matches WHERE ladder_id = $1 AND start_time >= $2 ORDER BY start_time, match_id",
                &[&ladder_id.0, &from]
            )
            .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for r in rows {
            let match_id: uuid::Uuid = r.get("match_id");
            let side_a: Vec<String> = r.get("side_a");
            let side_b: Vec<String> = r.get("side_b");
            let status: String = r.get("rating_status");
            let games = self.games_for_match(match_id).await?;

            matches.push(Match {
                match_id: MatchId(match_id),
                ladder_id: LadderId(r.get("ladder_id")),
                provider_id: super::types::ProviderId(r.get("provider_id")),
                organization_id: OrganizationId(r.get("organization_id")),
                start_time: r.get("start_time"),
                tier: r.get("tier"),
                sport: r.get("sport"),
                discipline: r.get("discipline"),
                format: r.get("format"),
                side_a: side_a.into_iter().map(PlayerId).collect(),
                side_b: side_b.into_iter().map(PlayerId).collect(),
                games,
                raw_payload: r.get("raw_payload"),
                rating_status: parse_rating_status(&status),
                rating_skip_reason: r.get("rating_skip_reason"),
                event_id: r.get("event_id"),
                competition_id: r.get("competition_id"),
                external_ref: r.get("external_ref"),
                venue_id: r.get("venue_id"),
                region_id: r.get::<_, Option<String>>("region_id").map(super::types::RegionId)
            });
        }
        Ok(matches)
    }

    async fn insert_match(&self, m: &Match) -> Result<(), DomainError> {
        let side_a: Vec<String> = m.side_a.iter().map(|p| p.0.clone()).collect();
        let side_b: Vec<String> = m.side_b.iter().map(|p| p.0.clone()).collect();
        self.client
            .execute(
                "INSERT INTO matches \
                 (match_id, ladder_id, provider_id, organization_id, start_time, tier, sport, discipline, \
                  format, side_a, side_b, raw_payload, rating_status, rating_skip_reason, event_id, \
                  competition_id, external_ref, venue_id, region_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
                &[
                    &m.match_id.0,
                    &m.ladder_id.0,
                    &m.provider_id.0,
                    &m.organization_id.0,
                    &m.start_time,
                    &m.tier,
                    &m.sport,
                    &m.discipline,
                    &m.format,
                    &side_a,
                    &side_b,
                    &m.raw_payload,
                    &rating_status_str(m.rating_status),
                    &m.rating_skip_reason,
                    &m.event_id,
                    &m.competition_id,
                    &m.external_ref,
                    &m.venue_id,
                    &m.region_id.as_ref().map(|r| r.0.clone())
                ]
            )
            .await?;

        for g in &m.games {
            self.client
                .execute(
                    "INSERT INTO match_games (match_id, game_no, a, b) VALUES ($1, $2, $3, $4)",
                    &[&m.match_id.0, &g.game_no, &g.a, &g.b]
                )
                .await?;
        }
        Ok(())
    }

    async fn latest_rating_event_before(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        before: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError> {
        self.latest_event(ladder_id, player_id, before, false).await
    }

    async fn latest_rating_event_as_of(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        as_of: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError> {
        self.latest_event(ladder_id, player_id, as_of, true).await
    }

    async fn delete_rating_history_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<(), DomainError> {
        self.client
            .execute(
                "DELETE FROM player_rating_history WHERE ladder_id = $1 AND applied_at >= $2",
                &[&ladder_id.0, &from]
            )
            .await?;
        self.client
            .execute(
                "DELETE FROM pair_synergy_history WHERE ladder_id = $1 AND applied_at >= $2",
                &[&ladder_id.0, &from]
            )
            .await?;
        Ok(())
    }

    async fn set_player_rating(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        state: RatingState
    ) -> Result<(), DomainError> {
        self.client
            .execute(
                "INSERT INTO player_ratings (player_id, ladder_id, mu, sigma, matches_count) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (player_id, ladder_id) DO UPDATE SET mu = $3, sigma = $4, matches_count = $5",
                &[&player_id.0, &ladder_id.0, &state.mu, &state.sigma, &(state.matches_count as i32)]
            )
            .await?;
        Ok(())
    }

    async fn set_pair_synergy(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        synergy: PairSynergy
    ) -> Result<(), DomainError> {
        self.client
            .execute(
                "INSERT INTO pair_synergies (ladder_id, player_id_a, player_id_b, gamma, matches) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (ladder_id, player_id_a, player_id_b) DO UPDATE SET gamma = $4, matches = $5",
                &[&ladder_id.0, &pair_key.0 .0, &pair_key.1 .0, &synergy.gamma, &(synergy.matches as i32)]
            )
            .await?;
        Ok(())
    }

    async fn list_leaderboard(
        &self,
        ladder_id: &LadderId,
        cursor: Option<LeaderboardCursor>,
        limit: usize
    ) -> Result<Vec<PlayerRating>, DomainError> {
        let rows = match cursor {
            Some(c) => {
                self.client
                    .query(
                        "SELECT player_id, mu, sigma, matches_count FROM player_ratings \
                         WHERE ladder_id = $1 AND (mu < $2 OR (mu = $2 AND player_id > $3)) \
                         ORDER BY mu DESC, player_id ASC LIMIT $4",
                        &[&ladder_id.0, &c.mu, &c.player_id.0, &(limit as i64)]
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        "SELECT player_id, mu, sigma, matches_count FROM player_ratings \
                         WHERE ladder_id = $1 ORDER BY mu DESC, player_id ASC LIMIT $2",
                        &[&ladder_id.0, &(limit as i64)]
                    )
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|r| PlayerRating {
                player_id: PlayerId(r.get("player_id")),
                ladder_id: ladder_id.clone(),
                mu: r.get("mu"),
                sigma: r.get("sigma"),
                matches_count: r.get::<_, i32>("matches_count") as u32
            })
            .collect())
    }

    async fn get_player_rank(&self, ladder_id: &LadderId, player_id: &PlayerId) -> Result<Option<u32>, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT (SELECT COUNT(*) FROM player_ratings o \
                  WHERE o.ladder_id = m.ladder_id AND (o.mu > m.mu OR (o.mu = m.mu AND o.player_id < m.player_id))) + 1 AS rank \
                 FROM player_ratings m WHERE m.ladder_id = $1 AND m.player_id = $2",
                &[&ladder_id.0, &player_id.0]
            )
            .await?;
        Ok(row.map(|r| r.get::<_, i64>("rank") as u32))
    }

    async fn rank_for_mu(&self, ladder_id: &LadderId, mu: f64) -> Result<u32, DomainError> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) AS better FROM player_ratings WHERE ladder_id = $1 AND mu > $2",
                &[&ladder_id.0, &mu]
            )
            .await?;
        Ok(row.get::<_, i64>("better") as u32 + 1)
    }

    async fn player_history(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Vec<RatingEventRow>, DomainError> {
        let rows = self
            .client
            .query(
                "SELECT rating_event_id, organization_id, player_id, ladder_id, match_id, applied_at, \
                 mu_before, mu_after, delta, sigma_before, sigma_after, win_probability_pre, \
                 opponent_mu_before, mov_weight \
                 FROM player_rating_history \
                 WHERE organization_id = $1 AND player_id = $2 \
                 ORDER BY applied_at ASC, rating_event_id ASC",
                &[&organization_id.0, &player_id.0]
            )
            .await?;
        Ok(rows.iter().map(row_to_rating_event).collect())
    }

    async fn upsert_insight_snapshot(
        &self,
        snapshot: &crate::insights::PlayerInsightsSnapshot
    ) -> Result<(), DomainError> {
        let payload = serde_json::to_value(snapshot).map_err(|e| DomainError::Internal(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO player_insight_snapshot (organization_id, player_id, snapshot, digest, updated_at) \
                 VALUES ($1, $2, $3, $4, now()) \
                 ON CONFLICT (organization_id, player_id) \
                 DO UPDATE SET snapshot = EXCLUDED.snapshot, digest = EXCLUDED.digest, updated_at = now()",
                &[
                    &snapshot.organization_id.0,
                    &snapshot.player_id.0,
                    &payload,
                    &snapshot.cache_keys.digest
                ]
            )
            .await?;
        Ok(())
    }

    async fn get_insight_snapshot(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Option<crate::insights::PlayerInsightsSnapshot>, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT snapshot FROM player_insight_snapshot WHERE organization_id = $1 AND player_id = $2",
                &[&organization_id.0, &player_id.0]
            )
            .await?;
        row.map(|r| {
            let value: serde_json::Value = r.get("snapshot");
            serde_json::from_value(value).map_err(|e| DomainError::Internal(e.to_string()))
        })
        .transpose()
    }

    async fn latest_pair_synergy_before(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        before: DateTime<Utc>
    ) -> Result<Option<PairSynergy>, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT gamma_after, matches_after FROM pair_synergy_history \
                 WHERE ladder_id = $1 AND player_id_a = $2 AND player_id_b = $3 AND applied_at < $4 \
                 ORDER BY applied_at DESC LIMIT 1",
                &[&ladder_id.0, &pair_key.0 .0, &pair_key.1 .0, &before]
            )
            .await?;
        Ok(row.map(|r| PairSynergy { gamma: r.get("gamma_after"), matches: r.get::<_, i32>("matches_after") as u32 }))
    }

    async fn get_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str
    ) -> Result<Option<crate::ingestion::IngestOutcome>, DomainError> {
        let row = self
            .client
            .query_opt(
                "SELECT response FROM ingest_idempotency_keys WHERE organization_id = $1 AND idempotency_key = $2",
                &[&organization_id.0, &idempotency_key]
            )
            .await?;
        row.map(|r| {
            let value: serde_json::Value = r.get("response");
            serde_json::from_value(value).map_err(|e| DomainError::Internal(e.to_string()))
        })
        .transpose()
    }

    async fn put_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str,
        outcome: &crate::ingestion::IngestOutcome
    ) -> Result<(), DomainError> {
        let payload = serde_json::to_value(outcome).map_err(|e| DomainError::Internal(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO ingest_idempotency_keys (organization_id, idempotency_key, response, created_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (organization_id, idempotency_key) DO NOTHING",
                &[&organization_id.0, &idempotency_key, &payload]
            )
            .await?;
        Ok(())
    }
}

fn row_to_rating_event(r: &tokio_postgres::Row) -> RatingEventRow {
    RatingEventRow {
        rating_event_id: RatingEventId(r.get("rating_event_id")),
        organization_id: OrganizationId(r.get("organization_id")),
        player_id: PlayerId(r.get("player_id")),
        ladder_id: LadderId(r.get("ladder_id")),
        match_id: MatchId(r.get("match_id")),
        applied_at: r.get("applied_at"),
        mu_before: r.get("mu_before"),
        mu_after: r.get("mu_after"),
        delta: r.get("delta"),
        sigma_before: r.get("sigma_before"),
        sigma_after: r.get("sigma_after"),
        win_probability_pre: r.get("win_probability_pre"),
        opponent_mu_before: r.get("opponent_mu_before"),
        mov_weight: r.get("mov_weight")
    }
}

impl PostgresStore {
    async fn games_for_match(&self, match_id: uuid::Uuid) -> Result<Vec<GameScoreLine>, DomainError> {
        let rows = self
            .client
            .query("SELECT game_no, a, b FROM match_games WHERE match_id = $1 ORDER BY game_no", &[&match_id])
            .await?;
        Ok(rows.iter().map(|r| GameScoreLine { game_no: r.get("game_no"), a: r.get("a"), b: r.get("b") }).collect())
    }

    async fn latest_event(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        bound: DateTime<Utc>,
        inclusive: bool
    ) -> Result<Option<RatingEventRow>, DomainError> {
        let comparator = if inclusive { "<=" } else { "<" };
        let query = format!(
            "SELECT rating_event_id, organization_id, player_id, ladder_id, match_id, applied_at, \
             mu_before, mu_after, delta, sigma_before, sigma_after, win_probability_pre, \
             opponent_mu_before, mov_weight \
             FROM player_rating_history \
             WHERE ladder_id = $1 AND player_id = $2 AND applied_at {comparator} $3 \
             ORDER BY applied_at DESC, rating_event_id DESC LIMIT 1"
        );
        let row = self.client.query_opt(&query, &[&ladder_id.0, &player_id.0, &bound]).await?;
        Ok(row.map(|r| row_to_rating_event(&r)))
    }
}

fn rating_status_str(status: RatingStatus) -> &'static str {
    match status {
        RatingStatus::Rated => "RATED",
        RatingStatus::Unrated => "UNRATED",
        RatingStatus::Pending => "PENDING"
    }
}

fn parse_rating_status(s: &str) -> RatingStatus {
    match s {
        "UNRATED" => RatingStatus::Unrated,
        "PENDING" => RatingStatus::Pending,
        _ => RatingStatus::Rated
    }
}
