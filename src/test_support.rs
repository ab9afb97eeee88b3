//! Test-only fakes for the HAL, vendor driver, fragmenter, buffer allocator
//! and fatal-handler collaborators (§9 Design Notes: "Testing substitutes
//! fakes").

#![cfg(test)]

use crate::config::BluetoothDeviceAddress;
use crate::correlator::FatalHandler;
use crate::error::Error;
use crate::fragmenter::{FragmentSink, Fragmenter};
use crate::hal::{DataReadyNotifier, Hal};
use crate::packet::{Packet, PacketType, UpwardTag};
use crate::reassembly::BufferAllocator;
use crate::upward::UpwardCallbacks;
use crate::vendor::{ChipPower, VendorCallbacks, VendorDriver};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct FakeHalInner {
    inbound: Mutex<HashMap<PacketType, VecDeque<u8>>>,
    transmitted: Mutex<Vec<(PacketType, Vec<u8>)>>,
    finished: Mutex<HashMap<PacketType, usize>>,
    notifier: Mutex<Option<Arc<dyn DataReadyNotifier>>>,
}

/// A [`Hal`] whose inbound byte stream and counters are driven directly by
/// tests instead of a real serial transport.
///
/// Cloning shares the same underlying queues and notifier (it is an `Arc`
/// handle): tests keep one clone to call [`FakeHal::deliver`] on after
/// handing another clone to `start_up` as the boxed `Hal` collaborator.
#[derive(Clone)]
pub struct FakeHal {
    inner: Arc<FakeHalInner>,
}

impl FakeHal {
    pub fn new() -> Self {
        FakeHal {
            inner: Arc::new(FakeHalInner {
                inbound: Mutex::new(HashMap::new()),
                transmitted: Mutex::new(Vec::new()),
                finished: Mutex::new(HashMap::new()),
                notifier: Mutex::new(None),
            }),
        }
    }

    pub fn push_bytes(&self, packet_type: PacketType, bytes: &[u8]) {
        self.inner.inbound.lock().unwrap().entry(packet_type).or_insert_with(VecDeque::new).extend(bytes.iter().copied());
    }

    /// Push bytes and, if a [`DataReadyNotifier`] has been bound via
    /// [`Hal::init`], notify it — waking a real event-loop thread the way a
    /// HAL's readiness callback would (§6 `data_ready(type)`).
    pub fn deliver(&self, packet_type: PacketType, bytes: &[u8]) {
        self.push_bytes(packet_type, bytes);
        if let Some(notifier) = self.inner.notifier.lock().unwrap().as_ref() {
            notifier.notify(packet_type);
        }
    }

    pub fn packet_finished_count(&self, packet_type: PacketType) -> usize {
        *self.inner.finished.lock().unwrap().get(&packet_type).unwrap_or(&0)
    }

    pub fn transmitted(&self) -> Vec<(PacketType, Vec<u8>)> {
        self.inner.transmitted.lock().unwrap().clone()
    }
}

impl Default for FakeHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for FakeHal {
    fn init(&mut self, notifier: Arc<dyn DataReadyNotifier>) {
        *self.inner.notifier.lock().unwrap() = Some(notifier);
    }

    fn open(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) {}

    fn read_data(&self, packet_type: PacketType, dst: &mut [u8], _block: bool) -> usize {
        let mut inbound = self.inner.inbound.lock().unwrap();
        let queue = match inbound.get_mut(&packet_type) {
            Some(queue) => queue,
            None => return 0,
        };
        let n = dst.len().min(queue.len());
        for slot in dst.iter_mut().take(n) {
            *slot = queue.pop_front().unwrap();
        }
        n
    }

    fn transmit_data(&self, packet_type: PacketType, bytes: &[u8]) {
        self.inner.transmitted.lock().unwrap().push((packet_type, bytes.to_vec()));
    }

    fn packet_finished(&self, packet_type: PacketType) {
        *self.inner.finished.lock().unwrap().entry(packet_type).or_insert(0) += 1;
    }
}

/// A [`Fragmenter`] that records everything handed to it instead of
/// fragmenting or reassembling anything.
pub struct RecordingFragmenter {
    pub dispatched: Vec<Packet>,
    pub reassembled: Vec<Packet>,
    sink: Option<Arc<dyn FragmentSink>>,
}

impl RecordingFragmenter {
    pub fn new() -> Self {
        RecordingFragmenter { dispatched: Vec::new(), reassembled: Vec::new(), sink: None }
    }
}

impl Default for RecordingFragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fragmenter for RecordingFragmenter {
    fn init(&mut self, sink: Arc<dyn FragmentSink>) {
        self.sink = Some(sink);
    }

    fn cleanup(&mut self) {
        self.sink = None;
    }

    fn fragment_and_dispatch(&mut self, packet: Packet) {
        self.dispatched.push(packet);
    }

    fn reassemble_and_dispatch(&mut self, packet: Packet) {
        self.reassembled.push(packet);
    }
}

/// A [`BufferAllocator`] that fails exactly on its `fail_on`-th call
/// (1-indexed), to exercise the reassembler's IGNORE path.
pub struct FailNthAllocator {
    call: usize,
    fail_on: usize,
}

impl FailNthAllocator {
    pub fn new(fail_on: usize) -> Self {
        FailNthAllocator { call: 0, fail_on }
    }
}

impl BufferAllocator for FailNthAllocator {
    fn allocate(&mut self, capacity: usize) -> Option<Vec<u8>> {
        self.call += 1;
        if self.call == self.fail_on {
            None
        } else {
            Some(vec![0u8; capacity])
        }
    }
}

/// A [`FatalHandler`] that records invocations instead of killing the
/// process, so the watchdog's "fatal on timeout" policy (§4.B, §9) stays
/// testable.
pub struct RecordingFatalHandler {
    messages: Mutex<Vec<String>>,
}

impl RecordingFatalHandler {
    pub fn new() -> Self {
        RecordingFatalHandler { messages: Mutex::new(Vec::new()) }
    }

    pub fn invocation_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Default for RecordingFatalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalHandler for RecordingFatalHandler {
    fn on_fatal(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Lets a test keep an `Arc<RecordingFatalHandler>` for assertions while
/// handing the `Box<dyn FatalHandler>` collaborator slot an equally-shared
/// handle.
impl FatalHandler for Arc<RecordingFatalHandler> {
    fn on_fatal(&self, message: &str) {
        (**self).on_fatal(message)
    }
}

/// A [`VendorDriver`] whose async commands complete synchronously and
/// inline, with knobs to simulate submission failure.
pub struct FakeVendorDriver {
    pub opened: bool,
    pub power: Option<ChipPower>,
    pub configure_firmware_calls: usize,
    pub configure_sco_calls: usize,
    pub epilog_calls: usize,
    pub fail_configure_sco_submission: bool,
    callbacks: Option<Arc<dyn VendorCallbacks>>,
}

impl FakeVendorDriver {
    pub fn new() -> Self {
        FakeVendorDriver {
            opened: false,
            power: None,
            configure_firmware_calls: 0,
            configure_sco_calls: 0,
            epilog_calls: 0,
            fail_configure_sco_submission: false,
            callbacks: None,
        }
    }
}

impl Default for FakeVendorDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorDriver for FakeVendorDriver {
    fn open(&mut self, _addr: BluetoothDeviceAddress, callbacks: Arc<dyn VendorCallbacks>) -> Result<(), Error> {
        self.opened = true;
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn set_chip_power(&mut self, power: ChipPower) -> Result<(), Error> {
        self.power = Some(power);
        Ok(())
    }

    fn send_configure_firmware(&mut self) -> Result<(), Error> {
        self.configure_firmware_calls += 1;
        if let Some(callbacks) = &self.callbacks {
            callbacks.firmware_configure_complete(true);
        }
        Ok(())
    }

    fn send_configure_sco(&mut self) -> Result<(), Error> {
        self.configure_sco_calls += 1;
        if self.fail_configure_sco_submission {
            return Err(Error::VendorCommandSubmission("configure_sco"));
        }
        if let Some(callbacks) = &self.callbacks {
            callbacks.sco_configure_complete(true);
        }
        Ok(())
    }

    fn send_epilog(&mut self) -> Result<(), Error> {
        self.epilog_calls += 1;
        if let Some(callbacks) = &self.callbacks {
            callbacks.epilog_complete();
        }
        Ok(())
    }
}

/// An [`UpwardCallbacks`] that records every call for assertions.
pub struct RecordingUpwardCallbacks {
    pub on_packet_calls: Mutex<Vec<UpwardTag>>,
    pub transmit_finished_calls: AtomicUsize,
    pub preload_results: Mutex<Vec<bool>>,
}

impl RecordingUpwardCallbacks {
    pub fn new() -> Self {
        RecordingUpwardCallbacks {
            on_packet_calls: Mutex::new(Vec::new()),
            transmit_finished_calls: AtomicUsize::new(0),
            preload_results: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingUpwardCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl UpwardCallbacks for RecordingUpwardCallbacks {
    fn on_packet(&self, tag: UpwardTag, _packet: Packet) {
        self.on_packet_calls.lock().unwrap().push(tag);
    }

    fn transmit_finished(&self, _packet: Packet, _all_sent: bool) {
        self.transmit_finished_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn preload_finished(&self, success: bool) {
        self.preload_results.lock().unwrap().push(success);
    }
}
