//! Action Resolver - turns gifts, coins and follows into side effects.
//!
//! The [`ActionResolver`] looks up the rules matching an event in the
//! current snapshot and fires their actions in declared order. Firing an
//! action means sending its commands to the [`CommandSink`], one by one,
//! then queueing its media for the action's destination.
//!
//! # Matching Priority
//!
//! ```text
//! Event            | Rules evaluated
//! -----------------|-----------------------------------------------
//! Gift "Rose", 1   | gift rules named "rose" (any case)
//!                  |   none matched -> coin rules containing 1
//! Coin 50          | coin rules with min <= 50 <= max
//! Follow           | the follow rule
//! Chat             | none (handled by the comment queue)
//! ```
//!
//! # Liveness Gate
//!
//! An action whose destination has not polled within the staleness window
//! is skipped entirely: no commands, no media. The rest of the rule still
//! runs.
//!
//! ```text
//! rule [a1, a2, a3]
//!   a1 -> main (active)   commands sent, media queued
//!   a2 -> side (stale)    skipped
//!   a3 -> main (active)   commands sent, media queued
//! ```

use crate::event::LiveEvent;
use crate::liveness::LivenessTracker;
use crate::media_queue::{DispatchPayload, MediaQueue};
use crate::metrics::Metrics;
use crate::sinks::CommandSink;
use crate::snapshot::{Action, ConfigStore, Rule, Snapshot};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened while resolving one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Rules that matched and were fired
    pub rules_matched: usize,

    /// True when a gift matched no gift rule and coin rules were used
    pub coin_fallback: bool,

    /// Action ids fired, in order
    pub actions_fired: Vec<String>,

    /// Action ids skipped (inactive destination or unknown id)
    pub actions_skipped: Vec<String>,

    pub commands_sent: usize,
    pub commands_failed: usize,
    pub media_enqueued: usize,
    pub media_refused: usize,
}

impl ResolveReport {
    pub fn is_noop(&self) -> bool {
        self.actions_fired.is_empty()
    }
}

pub struct ActionResolver {
    config: Arc<ConfigStore>,
    liveness: Arc<LivenessTracker>,
    media: Arc<MediaQueue>,
    commands: Arc<dyn CommandSink>,
    metrics: Arc<Metrics>,
}

impl ActionResolver {
    pub fn new(
        config: Arc<ConfigStore>,
        liveness: Arc<LivenessTracker>,
        media: Arc<MediaQueue>,
        commands: Arc<dyn CommandSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            liveness,
            media,
            commands,
            metrics,
        }
    }

    /// Fire every action triggered by `event`.
    ///
    /// Never fails: sink errors and full queues are logged and counted in
    /// the report, and resolution carries on with the next command/action.
    pub async fn resolve(&self, event: &LiveEvent) -> ResolveReport {
        let snapshot = self.config.current();
        let mut report = ResolveReport::default();

        let rules: Vec<&Rule> = match event {
            LiveEvent::Gift(gift) => {
                let gift_rules: Vec<&Rule> = snapshot.rules.gift_matches(&gift.name).collect();
                if gift_rules.is_empty() {
                    report.coin_fallback = true;
                    snapshot.rules.coin_matches(gift.diamonds).collect()
                } else {
                    gift_rules
                }
            }
            LiveEvent::Coin(coin) => snapshot.rules.coin_matches(coin.diamonds).collect(),
            LiveEvent::Follow(_) => snapshot.rules.follow().into_iter().collect(),
            LiveEvent::Chat(_) => Vec::new(),
        };

        if rules.is_empty() {
            debug!(kind = event.kind(), "No rules matched");
            return report;
        }

        for rule in rules {
            report.rules_matched += 1;
            self.fire_rule(&snapshot, rule, &mut report).await;
        }

        info!(
            kind = event.kind(),
            user = %event.user().display_name(),
            rules = report.rules_matched,
            fired = report.actions_fired.len(),
            skipped = report.actions_skipped.len(),
            coin_fallback = report.coin_fallback,
            "Event resolved"
        );

        report
    }

    async fn fire_rule(&self, snapshot: &Snapshot, rule: &Rule, report: &mut ResolveReport) {
        debug!(trigger = ?rule.trigger, actions = ?rule.action_ids, "Firing rule");

        for action_id in &rule.action_ids {
            match snapshot.action(action_id) {
                Some(action) => self.fire_action(action, report).await,
                None => {
                    warn!(action_id = %action_id, "Rule references unknown action, skipping");
                    Metrics::incr(&self.metrics.actions_skipped);
                    report.actions_skipped.push(action_id.clone());
                }
            }
        }
    }

    async fn fire_action(&self, action: &Action, report: &mut ResolveReport) {
        if !self.liveness.is_active(&action.destination) {
            info!(
                action_id = %action.id,
                destination = %action.destination,
                "Skipping action, destination not active"
            );
            Metrics::incr(&self.metrics.actions_skipped);
            report.actions_skipped.push(action.id.clone());
            return;
        }

        for command in &action.commands {
            match self.commands.send(command).await {
                Ok(()) => {
                    debug!(action_id = %action.id, command = %command, "Command sent");
                    Metrics::incr(&self.metrics.commands_sent);
                    report.commands_sent += 1;
                }
                Err(e) => {
                    warn!(
                        action_id = %action.id,
                        sink = %self.commands.name(),
                        command = %command,
                        error = %e,
                        "Command failed"
                    );
                    Metrics::incr(&self.metrics.commands_failed);
                    report.commands_failed += 1;
                }
            }
        }

        if let Some(media) = action.playable_media() {
            let payload = DispatchPayload::from_action(action, media);
            if self.media.enqueue(payload) {
                debug!(
                    action_id = %action.id,
                    destination = %action.destination,
                    media_path = %media.media_path,
                    "Media queued"
                );
                Metrics::incr(&self.metrics.media_enqueued);
                report.media_enqueued += 1;
            } else {
                info!(
                    action_id = %action.id,
                    destination = %action.destination,
                    "Media queue full, payload dropped"
                );
                Metrics::incr(&self.metrics.media_refused);
                report.media_refused += 1;
            }
        }

        Metrics::incr(&self.metrics.actions_fired);
        report.actions_fired.push(action.id.clone());
    }
}
