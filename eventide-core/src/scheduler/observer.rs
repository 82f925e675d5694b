//! Four-point hook into the scheduler's life cycle.

use super::command::{CommandResult, ScheduledCommand, Schedulable, TargetId};

/// Observes commands as they pass through the scheduler.
///
/// All hooks default to doing nothing.
pub trait SchedulerObserver<Id, C>: Send + Sync {
    /// Before deduplication and any precondition check.
    fn on_scheduling(&self, _command: &ScheduledCommand<Id, C>) {}

    /// After the command was accepted or deduplicated.
    fn on_scheduled(&self, _command: &ScheduledCommand<Id, C>) {}

    /// Before the precondition wait and enactment.
    fn on_delivering(&self, _command: &ScheduledCommand<Id, C>) {}

    /// After delivery, with the outcome recorded on the command.
    fn on_delivered(&self, _command: &ScheduledCommand<Id, C>) {}
}

/// Logs every hook point with `tracing`. Installed by default.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl<Id: TargetId, C: Schedulable> SchedulerObserver<Id, C> for TracingObserver {
    fn on_scheduling(&self, command: &ScheduledCommand<Id, C>) {
        tracing::trace!(
            target_id = %command.target_id,
            command = command.command.kind(),
            due_time = ?command.due_time,
            "scheduling command"
        );
    }

    fn on_scheduled(&self, command: &ScheduledCommand<Id, C>) {
        tracing::debug!(
            target_id = %command.target_id,
            command = command.command.kind(),
            result = ?command.result(),
            "command scheduled"
        );
    }

    fn on_delivering(&self, command: &ScheduledCommand<Id, C>) {
        tracing::trace!(
            target_id = %command.target_id,
            command = command.command.kind(),
            attempt = command.number_of_previous_attempts + 1,
            "delivering command"
        );
    }

    fn on_delivered(&self, command: &ScheduledCommand<Id, C>) {
        match command.result() {
            Some(CommandResult::Failed(failed)) => tracing::warn!(
                target_id = %command.target_id,
                command = command.command.kind(),
                attempt = failed.attempt,
                canceled = failed.is_canceled(),
                error = %failed.message,
                "command delivery failed"
            ),
            result => tracing::debug!(
                target_id = %command.target_id,
                command = command.command.kind(),
                ?result,
                "command delivered"
            ),
        }
    }
}
