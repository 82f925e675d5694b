//! Scheduled commands and their delivery outcome.

use std::{fmt, hash::Hash, time::Duration};

use chrono::{DateTime, Utc};

use super::precondition::DeliveryPrecondition;
use crate::command::Command;

/// Identifier of a scheduling target.
pub trait TargetId: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> TargetId for T where
    T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

/// A command type the scheduler can carry.
pub trait Schedulable: Command + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Schedulable for T where T: Command + Clone + fmt::Debug + Send + Sync + 'static {}

/// Where a scheduled command stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandResult {
    /// Accepted and waiting for delivery.
    Scheduled,
    /// The target already saw the command's token; nothing was scheduled.
    Deduplicated,
    Succeeded,
    Failed(CommandFailed),
}

impl CommandResult {
    /// Whether this is a delivery outcome rather than a waiting state.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

/// A delivery attempt that did not succeed.
///
/// Failure handlers receive this and may [`cancel`](Self::cancel) further
/// attempts or ask for another one with [`retry`](Self::retry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandFailed {
    pub message: String,
    /// 1 for the first delivery attempt.
    pub attempt: u32,
    canceled: bool,
    retry_after: Option<Duration>,
}

impl CommandFailed {
    pub fn new(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            message: message.into(),
            attempt,
            canceled: false,
            retry_after: None,
        }
    }

    /// Never deliver this command again. Overrides any retry request and the
    /// automatic retry policy.
    pub const fn cancel(&mut self) {
        self.canceled = true;
        self.retry_after = None;
    }

    /// Redeliver after `after`, regardless of the automatic retry policy.
    /// Ignored once canceled.
    pub const fn retry(&mut self, after: Duration) {
        if !self.canceled {
            self.retry_after = Some(after);
        }
    }

    pub const fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub const fn retry_requested(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {} failed: {}", self.attempt, self.message)
    }
}

/// A command bound for a target, with optional due time and precondition.
#[derive(Clone, Debug)]
pub struct ScheduledCommand<Id, C> {
    pub command: C,
    pub target_id: Id,
    /// Absent means "as soon as possible".
    pub due_time: Option<DateTime<Utc>>,
    pub precondition: Option<DeliveryPrecondition<Id>>,
    pub number_of_previous_attempts: u32,
    result: Option<CommandResult>,
}

impl<Id, C> ScheduledCommand<Id, C> {
    pub const fn new(target_id: Id, command: C) -> Self {
        Self {
            command,
            target_id,
            due_time: None,
            precondition: None,
            number_of_previous_attempts: 0,
            result: None,
        }
    }

    #[must_use]
    pub const fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    #[must_use]
    pub fn after(mut self, precondition: DeliveryPrecondition<Id>) -> Self {
        self.precondition = Some(precondition);
        self
    }

    pub const fn result(&self) -> Option<&CommandResult> {
        self.result.as_ref()
    }

    /// Record a new result.
    ///
    /// A terminal outcome is never replaced by [`CommandResult::Scheduled`];
    /// such a call is ignored and returns `false`.
    pub fn set_result(&mut self, result: CommandResult) -> bool {
        if result == CommandResult::Scheduled
            && self.result.as_ref().is_some_and(CommandResult::is_terminal)
        {
            return false;
        }
        self.result = Some(result);
        true
    }

    pub fn succeeded(&self) -> bool {
        self.result == Some(CommandResult::Succeeded)
    }

    pub const fn failure(&self) -> Option<&CommandFailed> {
        match &self.result {
            Some(CommandResult::Failed(failed)) => Some(failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_result_never_reverts_to_scheduled() {
        let mut scheduled = ScheduledCommand::new("t-1", ());
        assert!(scheduled.set_result(CommandResult::Scheduled));
        assert!(scheduled.set_result(CommandResult::Succeeded));
        assert!(!scheduled.set_result(CommandResult::Scheduled));
        assert_eq!(scheduled.result(), Some(&CommandResult::Succeeded));

        let mut deduplicated = ScheduledCommand::new("t-1", ());
        deduplicated.set_result(CommandResult::Deduplicated);
        assert!(!deduplicated.set_result(CommandResult::Scheduled));
    }

    #[test]
    fn failed_can_be_followed_by_another_outcome() {
        let mut scheduled = ScheduledCommand::new("t-1", ());
        scheduled.set_result(CommandResult::Failed(CommandFailed::new("boom", 1)));
        assert!(scheduled.failure().is_some());
        assert!(scheduled.set_result(CommandResult::Succeeded));
        assert!(scheduled.succeeded());
    }

    #[test]
    fn cancel_overrides_retry() {
        let mut failed = CommandFailed::new("boom", 2);
        failed.retry(Duration::from_secs(5));
        assert_eq!(failed.retry_requested(), Some(Duration::from_secs(5)));

        failed.cancel();
        assert!(failed.is_canceled());
        assert_eq!(failed.retry_requested(), None);

        failed.retry(Duration::from_secs(1));
        assert_eq!(failed.retry_requested(), None);
        assert_eq!(failed.to_string(), "attempt 2 failed: boom");
    }
}
