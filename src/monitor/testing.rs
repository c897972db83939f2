//! Entities shared by the monitor unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::accessor::{Accessor, Command};
use crate::entity::{Affinity, MemberChange, Observable, ObservableCore};
use crate::error::ReadError;

/// A command whose runnability is toggled by the test.
pub(crate) struct Toggle {
    runnable: AtomicBool,
}

impl Toggle {
    pub(crate) fn new(runnable: bool) -> Self {
        Self {
            runnable: AtomicBool::new(runnable),
        }
    }

    pub(crate) fn set(&self, runnable: bool) {
        self.runnable.store(runnable, Ordering::SeqCst);
    }
}

impl Command for Toggle {
    fn can_execute(&self) -> bool {
        self.runnable.load(Ordering::SeqCst)
    }
}

/// A value whose equality check always panics.
#[derive(Debug)]
pub(crate) struct Brittle(pub(crate) i32);

impl PartialEq for Brittle {
    fn eq(&self, _other: &Self) -> bool {
        panic!("broken equality")
    }
}

/// Entity with a value, a reference and a command member.
pub(crate) struct Widget {
    core: ObservableCore,
    value: Mutex<i32>,
    label: Mutex<Arc<String>>,
    command: Mutex<Option<Arc<dyn Command>>>,
    changes: Mutex<Vec<MemberChange>>,
    pub(crate) fail_reads: AtomicBool,
    pub(crate) panic_on_notify: AtomicBool,
}

impl Widget {
    pub(crate) fn new(value: i32) -> Self {
        Self::with_affinity(value, Affinity::ThreadSafe)
    }

    pub(crate) fn with_affinity(value: i32, affinity: Affinity) -> Self {
        Self {
            core: ObservableCore::new(affinity),
            value: Mutex::new(value),
            label: Mutex::new(Arc::new("widget".to_string())),
            command: Mutex::new(None),
            changes: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
            panic_on_notify: AtomicBool::new(false),
        }
    }

    pub(crate) fn value(&self) -> i32 {
        *self.value.lock().unwrap()
    }

    pub(crate) fn set_value(&self, value: i32) {
        *self.value.lock().unwrap() = value;
    }

    pub(crate) fn label(&self) -> Arc<String> {
        Arc::clone(&self.label.lock().unwrap())
    }

    pub(crate) fn set_label(&self, label: Arc<String>) {
        *self.label.lock().unwrap() = label;
    }

    pub(crate) fn set_command(&self, command: Option<Arc<dyn Command>>) {
        *self.command.lock().unwrap() = command;
    }

    pub(crate) fn changes(&self) -> Vec<MemberChange> {
        self.changes.lock().unwrap().clone()
    }

    pub(crate) fn value_accessor() -> Accessor<Self> {
        Accessor::try_value("value", |w: &Self| {
            if w.fail_reads.load(Ordering::SeqCst) {
                Err(ReadError::unavailable("value offline"))
            } else {
                Ok(w.value())
            }
        })
    }

    pub(crate) fn label_accessor() -> Accessor<Self> {
        Accessor::reference("label", |w: &Self| Some(w.label()))
    }

    pub(crate) fn command_accessor() -> Accessor<Self> {
        Accessor::command("command", |w: &Self| w.command.lock().unwrap().clone())
    }
}

impl Observable for Widget {
    fn observable_core(&self) -> &ObservableCore {
        &self.core
    }

    fn accessors() -> Vec<Accessor<Self>> {
        vec![Self::value_accessor(), Self::label_accessor(), Self::command_accessor()]
    }

    fn member_changed(&self, change: &MemberChange) {
        assert!(
            !self.panic_on_notify.load(Ordering::SeqCst),
            "handler refused {}",
            change.member()
        );
        self.changes.lock().unwrap().push(change.clone());
    }
}

/// Shared handle helper.
pub(crate) fn widget(value: i32, affinity: Affinity) -> Arc<Widget> {
    Arc::new(Widget::with_affinity(value, affinity))
}
