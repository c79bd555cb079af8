//! Mock BLE Backend
//!
//! In-memory [`BleCentral`] that records every command into a shared journal
//! instead of touching a radio. Tests drive the engine by feeding
//! [`CentralEvent`]s directly and asserting on the journal.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::infrastructure::bluetooth::platform::{AdapterState, BleCentral, PeripheralId};

/// One recorded platform command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    StartScan(Uuid),
    StopScan,
    Connect(PeripheralId),
    CancelConnection(PeripheralId),
    DiscoverServices(PeripheralId, Uuid),
    DiscoverCharacteristics(PeripheralId, Uuid),
    Subscribe(PeripheralId, Uuid),
    Read(PeripheralId, Uuid),
    Write(PeripheralId, Uuid, Vec<u8>),
}

/// Shared view of everything a [`MockCentral`] has been asked to do.
#[derive(Debug, Clone)]
pub struct MockJournal {
    commands: Arc<Mutex<Vec<MockCommand>>>,
    adapter_state: Arc<Mutex<AdapterState>>,
}

impl Default for MockJournal {
    fn default() -> Self {
        Self {
            commands: Arc::default(),
            adapter_state: Arc::new(Mutex::new(AdapterState::PoweredOn)),
        }
    }
}

impl MockJournal {
    /// All commands recorded so far, oldest first.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Drains and returns the recorded commands.
    pub fn take_commands(&self) -> Vec<MockCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }

    /// Changes what the mock adapter reports to `adapter_state()` queries.
    /// Pair with an injected `AdapterStateChanged` event to notify the engine.
    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.adapter_state.lock().unwrap() = state;
    }
}

/// Command-recording BLE backend for tests.
pub struct MockCentral {
    journal: MockJournal,
}

impl MockCentral {
    pub fn new() -> (Self, MockJournal) {
        let journal = MockJournal::default();
        (
            Self {
                journal: journal.clone(),
            },
            journal,
        )
    }
}

impl BleCentral for MockCentral {
    fn adapter_state(&self) -> AdapterState {
        *self.journal.adapter_state.lock().unwrap()
    }

    fn start_scan(&mut self, service: Uuid) {
        self.record(MockCommand::StartScan(service));
    }

    fn stop_scan(&mut self) {
        self.record(MockCommand::StopScan);
    }

    fn connect(&mut self, id: PeripheralId) {
        self.record(MockCommand::Connect(id));
    }

    fn cancel_connection(&mut self, id: PeripheralId) {
        self.record(MockCommand::CancelConnection(id));
    }

    fn discover_services(&mut self, id: PeripheralId, service: Uuid) {
        self.record(MockCommand::DiscoverServices(id, service));
    }

    fn discover_characteristics(&mut self, id: PeripheralId, service: Uuid) {
        self.record(MockCommand::DiscoverCharacteristics(id, service));
    }

    fn subscribe(&mut self, id: PeripheralId, characteristic: Uuid) {
        self.record(MockCommand::Subscribe(id, characteristic));
    }

    fn read(&mut self, id: PeripheralId, characteristic: Uuid) {
        self.record(MockCommand::Read(id, characteristic));
    }

    fn write_with_response(&mut self, id: PeripheralId, characteristic: Uuid, value: &[u8]) {
        self.record(MockCommand::Write(id, characteristic, value.to_vec()));
    }
}

impl MockCentral {
    fn record(&self, command: MockCommand) {
        self.journal.commands.lock().unwrap().push(command);
    }
}
