//! Value bags: the per-member snapshot and diff state machine.
//!
//! One cycle drives a bag through `refresh` (read into `new`), `analyze`
//! (compare `new` against `current`) and, when something changed, `notify`
//! (deliver, then re-baseline `current` from a fresh read). `new` never
//! survives into the next cycle.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::accessor::{Accessor, CommandTarget, DynValue, Identity, MemberKind, RawReading};
use crate::entity::{ChangeKind, MemberChange, Observable};
use crate::error::{panic_message, ReadError};

use super::stats::MonitorStats;

/// Comparable state of one member at one instant.
#[derive(Debug)]
pub(crate) enum Reading {
    Value(Box<dyn DynValue>),
    Reference(Option<Identity>),
    Command {
        target: Option<Identity>,
        signal: bool,
    },
}

impl Reading {
    fn take<T>(accessor: &Accessor<T>, entity: &T) -> Result<Self, ReadError> {
        match accessor.read(entity)? {
            RawReading::Value(value) => Ok(Self::Value(value)),
            RawReading::Reference(identity) => Ok(Self::Reference(identity)),
            RawReading::Command(target) => {
                let signal = match &target {
                    None => false,
                    Some(cmd) => catch_unwind(AssertUnwindSafe(|| cmd.signal())).map_err(|payload| {
                        ReadError::Panicked {
                            message: panic_message(payload.as_ref()),
                        }
                    })?,
                };
                Ok(Self::Command {
                    target: target.map(CommandTarget::into_identity),
                    signal,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Verdict {
    value: bool,
    runnable: bool,
}

/// Compares two readings. `Err` carries the message of a panicking `eq`.
fn compare(old: &Reading, new: &Reading) -> Result<Verdict, String> {
    match (old, new) {
        (Reading::Value(old), Reading::Value(new)) => {
            catch_unwind(AssertUnwindSafe(|| !old.dyn_eq(new.as_ref())))
                .map(|changed| Verdict {
                    value: changed,
                    runnable: false,
                })
                .map_err(|payload| panic_message(payload.as_ref()))
        }
        (Reading::Reference(old), Reading::Reference(new)) => Ok(Verdict {
            value: old.as_ref().map(Identity::addr) != new.as_ref().map(Identity::addr),
            runnable: false,
        }),
        (
            Reading::Command {
                target: old_target,
                signal: old_signal,
            },
            Reading::Command {
                target: new_target,
                signal: new_signal,
            },
        ) => {
            let identity =
                old_target.as_ref().map(Identity::addr) != new_target.as_ref().map(Identity::addr);
            // A different command object always re-announces its runnable state.
            Ok(Verdict {
                value: identity,
                runnable: identity || old_signal != new_signal,
            })
        }
        _ => Ok(Verdict {
            value: true,
            runnable: false,
        }),
    }
}

/// Diff state for one observable member.
pub(crate) struct ValueBag<T> {
    accessor: Accessor<T>,
    current: Option<Reading>,
    new: Option<Reading>,
    valid: bool,
    changed: Verdict,
    equality_faulted: bool,
    notify_faulted: bool,
}

impl<T: Observable> ValueBag<T> {
    /// Builds the bag and takes the initial reading.
    pub(crate) fn new(accessor: Accessor<T>, entity: &T, stats: &MonitorStats) -> Self {
        let mut bag = Self {
            accessor,
            current: None,
            new: None,
            valid: true,
            changed: Verdict::default(),
            equality_faulted: false,
            notify_faulted: false,
        };
        match Reading::take(&bag.accessor, entity) {
            Ok(reading) => bag.current = Some(reading),
            Err(err) => bag.mark_invalid(&err, stats),
        }
        bag
    }

    pub(crate) fn name(&self) -> &str {
        self.accessor.name()
    }

    #[cfg(test)]
    pub(crate) const fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) const fn is_changed(&self) -> bool {
        self.changed.value || self.changed.runnable
    }

    fn is_command(&self) -> bool {
        self.accessor.kind() != MemberKind::Property
    }

    fn mark_invalid(&mut self, err: &ReadError, stats: &MonitorStats) {
        if !self.valid {
            return;
        }
        self.valid = false;
        stats.record_read_fault();
        warn!(
            member = self.accessor.name(),
            owner = self.accessor.owner(),
            error = %err,
            "observable member read failed"
        );
    }

    fn mark_valid(&mut self) {
        if self.valid {
            return;
        }
        self.valid = true;
        debug!(
            member = self.accessor.name(),
            owner = self.accessor.owner(),
            "observable member read recovered"
        );
    }

    /// Read phase: replaces `new` with a fresh reading.
    pub(crate) fn refresh(&mut self, entity: &T, stats: &MonitorStats) {
        self.new = None;
        match Reading::take(&self.accessor, entity) {
            Ok(reading) => {
                self.mark_valid();
                self.new = Some(reading);
            }
            Err(err) => self.mark_invalid(&err, stats),
        }
    }

    /// Diff phase. Returns true if a notification is due.
    ///
    /// A missing `new` (failed read) counts as unchanged. A panicking
    /// equality check counts as unchanged and is logged once until a
    /// comparison succeeds again.
    pub(crate) fn analyze(&mut self, stats: &MonitorStats) -> bool {
        self.changed = Verdict::default();
        let Some(new) = self.new.as_ref() else {
            return false;
        };

        let verdict = match self.current.as_ref() {
            // First successful read after a failed initial one.
            None => Ok(Verdict {
                value: true,
                runnable: self.is_command(),
            }),
            Some(current) => compare(current, new),
        };

        match verdict {
            Ok(verdict) => {
                self.equality_faulted = false;
                self.changed = verdict;
            }
            Err(message) => {
                if !self.equality_faulted {
                    self.equality_faulted = true;
                    stats.record_equality_fault();
                    warn!(
                        member = self.accessor.name(),
                        owner = self.accessor.owner(),
                        error = %message,
                        "observable member equality check panicked"
                    );
                }
            }
        }

        if !self.is_changed() {
            self.new = None;
        }
        self.is_changed()
    }

    /// Delivery phase. Returns the number of notifications delivered.
    pub(crate) fn notify(&mut self, entity: &T, stats: &MonitorStats) -> usize {
        if !self.is_changed() {
            self.new = None;
            return 0;
        }

        let mut delivered = 0;
        let mut faulted = false;
        for (due, kind) in [
            (self.changed.value, ChangeKind::Value),
            (self.changed.runnable, ChangeKind::Runnable),
        ] {
            if !due {
                continue;
            }
            let change = MemberChange::new(self.accessor.shared_name(), self.accessor.owner(), kind);
            match catch_unwind(AssertUnwindSafe(|| entity.member_changed(&change))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    faulted = true;
                    if !self.notify_faulted {
                        stats.record_notify_fault();
                        warn!(
                            member = self.accessor.name(),
                            owner = self.accessor.owner(),
                            kind = ?kind,
                            error = %panic_message(payload.as_ref()),
                            "change notification handler panicked"
                        );
                    }
                    self.notify_faulted = true;
                }
            }
        }
        if !faulted {
            self.notify_faulted = false;
        }
        stats.record_notifications(delivered);
        self.changed = Verdict::default();

        // Baseline on what the entity holds now, not on what was diffed.
        let observed = self.new.take();
        match Reading::take(&self.accessor, entity) {
            Ok(fresh) => {
                self.mark_valid();
                self.current = Some(fresh);
            }
            Err(err) => {
                self.mark_invalid(&err, stats);
                if observed.is_some() {
                    self.current = observed;
                }
            }
        }

        delivered
    }

    #[cfg(test)]
    pub(crate) fn current_value<V: Clone + 'static>(&self) -> Option<V> {
        match self.current.as_ref()? {
            Reading::Value(value) => value.as_any().downcast_ref::<V>().cloned(),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) const fn has_pending(&self) -> bool {
        self.new.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::monitor::testing::{Brittle, Toggle, Widget};

    fn value_bag(widget: &Widget, stats: &MonitorStats) -> ValueBag<Widget> {
        ValueBag::new(Widget::value_accessor(), widget, stats)
    }

    fn cycle(bag: &mut ValueBag<Widget>, widget: &Widget, stats: &MonitorStats) -> usize {
        bag.refresh(widget, stats);
        if bag.analyze(stats) {
            bag.notify(widget, stats)
        } else {
            0
        }
    }

    #[test]
    fn unchanged_value_is_not_reported() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let mut bag = value_bag(&widget, &stats);

        for _ in 0..3 {
            assert_eq!(cycle(&mut bag, &widget, &stats), 0);
            assert!(!bag.has_pending());
        }
        assert!(widget.changes().is_empty());
    }

    #[test]
    fn single_mutation_reported_once_and_baselined() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let mut bag = value_bag(&widget, &stats);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        widget.set_value(5);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        assert_eq!(bag.current_value::<i32>(), Some(5));
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        let changes = widget.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].member(), "value");
        assert_eq!(changes[0].kind(), ChangeKind::Value);
        assert_eq!(stats.notifications(), 1);
    }

    #[test]
    fn revert_before_refresh_is_invisible() {
        let stats = MonitorStats::default();
        let widget = Widget::new(1);
        let mut bag = value_bag(&widget, &stats);

        widget.set_value(2);
        widget.set_value(1);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
    }

    #[test]
    fn notify_baselines_on_fresh_read() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let mut bag = value_bag(&widget, &stats);

        widget.set_value(5);
        bag.refresh(&widget, &stats);
        assert!(bag.analyze(&stats));
        // Mutated again between analyze and notify.
        widget.set_value(9);
        assert_eq!(bag.notify(&widget, &stats), 1);
        assert_eq!(bag.current_value::<i32>(), Some(9));
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
    }

    #[test]
    fn failing_reads_log_once_per_transition() {
        let stats = MonitorStats::default();
        let widget = Widget::new(3);
        let mut bag = value_bag(&widget, &stats);

        widget.fail_reads.store(true, Ordering::SeqCst);
        for _ in 0..4 {
            assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        }
        assert!(!bag.is_valid());
        assert_eq!(stats.read_faults(), 1);

        widget.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        assert!(bag.is_valid());

        widget.fail_reads.store(true, Ordering::SeqCst);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        assert_eq!(stats.read_faults(), 2);
    }

    #[test]
    fn value_changed_while_failing_is_reported_after_recovery() {
        let stats = MonitorStats::default();
        let widget = Widget::new(3);
        let mut bag = value_bag(&widget, &stats);

        widget.fail_reads.store(true, Ordering::SeqCst);
        widget.set_value(4);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        widget.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        assert_eq!(bag.current_value::<i32>(), Some(4));
    }

    #[test]
    fn failed_initial_read_reports_first_success() {
        let stats = MonitorStats::default();
        let widget = Widget::new(7);
        widget.fail_reads.store(true, Ordering::SeqCst);
        let mut bag = value_bag(&widget, &stats);
        assert!(!bag.is_valid());
        assert_eq!(stats.read_faults(), 1);

        widget.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        assert_eq!(bag.current_value::<i32>(), Some(7));
    }

    #[test]
    fn panicking_equality_is_unchanged_and_logged_once() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let accessor = Accessor::value("brittle", |w: &Widget| Brittle(w.value()));
        let mut bag = ValueBag::new(accessor, &widget, &stats);

        widget.set_value(1);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        widget.set_value(2);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        assert_eq!(stats.equality_faults(), 1);
        assert!(widget.changes().is_empty());
        assert!(!bag.has_pending());
    }

    #[test]
    fn reference_members_compare_identity() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let mut bag = ValueBag::new(Widget::label_accessor(), &widget, &stats);

        // Equal content, different object.
        widget.set_label(Arc::new(widget.label().as_str().to_string()));
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
    }

    #[test]
    fn command_identity_swap_reports_value_and_runnable_once() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        widget.set_command(Some(Arc::new(Toggle::new(true))));
        let mut bag = ValueBag::new(Widget::command_accessor(), &widget, &stats);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        // Same runnability, different object.
        widget.set_command(Some(Arc::new(Toggle::new(true))));
        assert_eq!(cycle(&mut bag, &widget, &stats), 2);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        let kinds: Vec<_> = widget.changes().iter().map(MemberChange::kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Value, ChangeKind::Runnable]);
    }

    #[test]
    fn snapshots_do_not_keep_members_alive() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let toggle = Arc::new(Toggle::new(true));
        widget.set_command(Some(Arc::clone(&toggle) as Arc<dyn crate::accessor::Command>));
        let label = widget.label();
        let mut command_bag = ValueBag::new(Widget::command_accessor(), &widget, &stats);
        let mut label_bag = ValueBag::new(Widget::label_accessor(), &widget, &stats);
        assert_eq!(Arc::strong_count(&toggle), 2);
        assert_eq!(Arc::strong_count(&label), 2);

        widget.set_command(None);
        widget.set_label(Arc::new("renamed".to_string()));
        assert_eq!(Arc::strong_count(&toggle), 1);
        assert_eq!(Arc::strong_count(&label), 1);

        // Swapped-out objects are still told apart from their replacements.
        assert_eq!(cycle(&mut command_bag, &widget, &stats), 2);
        assert_eq!(cycle(&mut label_bag, &widget, &stats), 1);
        assert_eq!(Arc::strong_count(&toggle), 1);
    }

    #[test]
    fn command_runnable_flip_reports_runnable_only() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let toggle = Arc::new(Toggle::new(true));
        widget.set_command(Some(Arc::clone(&toggle) as Arc<dyn crate::accessor::Command>));
        let mut bag = ValueBag::new(Widget::command_accessor(), &widget, &stats);

        toggle.set(false);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        assert_eq!(widget.changes()[0].kind(), ChangeKind::Runnable);
    }

    #[test]
    fn parameterized_command_tracks_running_state() {
        use std::any::Any;
        use std::sync::atomic::AtomicBool;

        use crate::accessor::ParameterizedCommand;

        struct Upload {
            running: AtomicBool,
        }

        impl ParameterizedCommand for Upload {
            fn can_execute_with(&self, _parameter: &(dyn Any + Send + Sync)) -> bool {
                true
            }

            fn is_running(&self) -> bool {
                self.running.load(Ordering::SeqCst)
            }
        }

        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let upload = Arc::new(Upload {
            running: AtomicBool::new(false),
        });
        let shared = Arc::clone(&upload);
        let accessor = Accessor::parameterized_command("upload", move |_: &Widget| {
            Some(Arc::clone(&shared) as Arc<dyn ParameterizedCommand>)
        });
        let mut bag = ValueBag::new(accessor, &widget, &stats);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);

        upload.running.store(true, Ordering::SeqCst);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        upload.running.store(false, Ordering::SeqCst);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);

        let kinds: Vec<_> = widget.changes().iter().map(MemberChange::kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Runnable, ChangeKind::Runnable]);
    }

    #[test]
    fn panicking_handler_is_contained_and_logged_once() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        widget.panic_on_notify.store(true, Ordering::SeqCst);
        let mut bag = value_bag(&widget, &stats);

        widget.set_value(1);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        widget.set_value(2);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        assert_eq!(stats.notify_faults(), 1);
        // Baseline still moved, so the same value is not re-announced.
        assert_eq!(bag.current_value::<i32>(), Some(2));

        widget.panic_on_notify.store(false, Ordering::SeqCst);
        widget.set_value(3);
        assert_eq!(cycle(&mut bag, &widget, &stats), 1);
        widget.panic_on_notify.store(true, Ordering::SeqCst);
        widget.set_value(4);
        assert_eq!(cycle(&mut bag, &widget, &stats), 0);
        assert_eq!(stats.notify_faults(), 2);
    }

    #[test]
    fn bag_reports_member_name() {
        let stats = MonitorStats::default();
        let widget = Widget::new(0);
        let bag = value_bag(&widget, &stats);
        assert_eq!(bag.name(), "value");
    }
}
