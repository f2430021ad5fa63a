//! Pure transition logic for the provisioning state machine. The tick engine
//! is glue; everything that can be decided without I/O is decided here.

use chrono::{DateTime, Duration, Utc};

use crate::db::models::{InstallStatus, InstallStep};

/// Dwell time in `verify_sync` before the install is declared ready, giving
/// the installer's webhook registration a moment to settle.
pub const SYNC_SETTLE_SECONDS: i64 = 3;

/// Step order of a successful install. Observed step sequences are
/// subsequences of this list.
pub const STEP_ORDER: [InstallStep; 7] = [
    InstallStep::CreateProject,
    InstallStep::WaitDatabaseReady,
    InstallStep::ApplySchema,
    InstallStep::VerifyConnection,
    InstallStep::StartSync,
    InstallStep::VerifySync,
    InstallStep::Done,
];

/// Terminal statuses accept no further transitions.
pub fn is_terminal(status: &InstallStatus) -> bool {
    matches!(status, InstallStatus::Ready | InstallStatus::Error)
}

/// The status a row carries while sitting on a given step.
pub fn status_for_step(step: InstallStep) -> InstallStatus {
    match step {
        InstallStep::CreateProject | InstallStep::CreateDatabase | InstallStep::WaitDatabaseReady => {
            InstallStatus::Provisioning
        }
        InstallStep::ApplySchema | InstallStep::VerifyConnection => InstallStatus::Installing,
        InstallStep::StartSync | InstallStep::VerifySync => InstallStatus::Syncing,
        InstallStep::Done => InstallStatus::Ready,
    }
}

/// What a tick should do for a row in the given state. At most one external
/// side effect hides behind each action.
#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Move to the given step; nothing external to touch.
    Advance(InstallStep),
    /// Run the single database readiness probe.
    ProbeDatabase,
    /// Refresh the tenant token and invoke the sync installer once.
    RunSyncInstall,
    /// Wait out the settle window, then complete.
    SettleSync,
    /// Terminal state; leave the row alone.
    Noop,
}

pub fn plan_tick(status: &InstallStatus, step: Option<InstallStep>) -> TickAction {
    if is_terminal(status) {
        return TickAction::Noop;
    }
    match step {
        // Fresh rows and anything unrecognized normalize onto the wait.
        None | Some(InstallStep::CreateProject) | Some(InstallStep::CreateDatabase) => {
            TickAction::Advance(InstallStep::WaitDatabaseReady)
        }
        Some(InstallStep::WaitDatabaseReady) => TickAction::ProbeDatabase,
        Some(InstallStep::ApplySchema) => TickAction::Advance(InstallStep::VerifyConnection),
        Some(InstallStep::VerifyConnection) => TickAction::Advance(InstallStep::StartSync),
        Some(InstallStep::StartSync) => TickAction::RunSyncInstall,
        Some(InstallStep::VerifySync) => TickAction::SettleSync,
        // A done step under a non-terminal status is an inconsistent row;
        // re-assert the terminal pair.
        Some(InstallStep::Done) => TickAction::Advance(InstallStep::Done),
    }
}

/// Whether the readiness wait has outlived its budget, measured wall-clock
/// from when the state was entered.
pub fn wait_deadline_exceeded(
    entered_at: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    now - entered_at > timeout
}

/// Whether the sync settle window has elapsed.
pub fn sync_settled(entered_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - entered_at >= Duration::seconds(SYNC_SETTLE_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstallStatus::*;
    use InstallStep::*;

    #[test]
    fn terminal_states() {
        assert!(is_terminal(&Ready));
        assert!(is_terminal(&Error));
        for status in [Pending, Provisioning, Installing, Syncing] {
            assert!(!is_terminal(&status));
        }
    }

    #[test]
    fn status_matches_step() {
        assert_eq!(status_for_step(CreateProject), Provisioning);
        assert_eq!(status_for_step(WaitDatabaseReady), Provisioning);
        assert_eq!(status_for_step(ApplySchema), Installing);
        assert_eq!(status_for_step(VerifyConnection), Installing);
        assert_eq!(status_for_step(StartSync), Syncing);
        assert_eq!(status_for_step(VerifySync), Syncing);
        // ready if and only if done
        assert_eq!(status_for_step(Done), Ready);
        for step in STEP_ORDER.iter().filter(|s| **s != Done) {
            assert_ne!(status_for_step(*step), Ready);
        }
    }

    #[test]
    fn fresh_and_unknown_rows_normalize_to_the_wait() {
        for step in [None, Some(CreateProject), Some(CreateDatabase)] {
            assert_eq!(
                plan_tick(&Pending, step),
                TickAction::Advance(WaitDatabaseReady)
            );
            assert_eq!(
                plan_tick(&Provisioning, step),
                TickAction::Advance(WaitDatabaseReady)
            );
        }
    }

    #[test]
    fn each_step_plans_its_action() {
        assert_eq!(plan_tick(&Provisioning, Some(WaitDatabaseReady)), TickAction::ProbeDatabase);
        assert_eq!(
            plan_tick(&Installing, Some(ApplySchema)),
            TickAction::Advance(VerifyConnection)
        );
        assert_eq!(
            plan_tick(&Installing, Some(VerifyConnection)),
            TickAction::Advance(StartSync)
        );
        assert_eq!(plan_tick(&Syncing, Some(StartSync)), TickAction::RunSyncInstall);
        assert_eq!(plan_tick(&Syncing, Some(VerifySync)), TickAction::SettleSync);
    }

    #[test]
    fn terminal_rows_are_left_alone() {
        for step in [None, Some(WaitDatabaseReady), Some(StartSync), Some(Done)] {
            assert_eq!(plan_tick(&Ready, step), TickAction::Noop);
            assert_eq!(plan_tick(&Error, step), TickAction::Noop);
        }
    }

    #[test]
    fn advances_only_move_forward() {
        // Any Advance planned from a step in the canonical order must land
        // strictly later in that order.
        let position = |step: &InstallStep| STEP_ORDER.iter().position(|s| s == step);
        for (i, step) in STEP_ORDER.iter().enumerate() {
            if let TickAction::Advance(next) = plan_tick(&status_for_step(*step), Some(*step)) {
                if let Some(j) = position(&next) {
                    assert!(j > i, "{step} advanced backwards to {next}");
                }
            }
        }
    }

    #[test]
    fn wait_timeout_is_wall_clock() {
        let entered = Utc::now();
        let timeout = Duration::seconds(600);
        assert!(!wait_deadline_exceeded(entered, entered + Duration::seconds(599), timeout));
        assert!(!wait_deadline_exceeded(entered, entered + Duration::seconds(600), timeout));
        assert!(wait_deadline_exceeded(entered, entered + Duration::seconds(601), timeout));
    }

    #[test]
    fn settle_window_is_three_seconds() {
        let entered = Utc::now();
        assert!(!sync_settled(entered, entered + Duration::seconds(2)));
        assert!(sync_settled(entered, entered + Duration::seconds(3)));
        assert!(sync_settled(entered, entered + Duration::seconds(30)));
    }
}
