//! Protocol engine for the control bus, master side.
//!
//! The engine is an actor task that exclusively owns one [`IoDevice`]. Work
//! arrives as jobs over a channel and queues in a deque; the job at the front
//! of the queue is the one on the wire while the bus state is `Transfer`.
//! Unicast jobs resolve when a validated response arrives or their watchdog
//! gives up; broadcast jobs resolve on the device's transfer-complete event
//! and never carry a response.
//!
//! Every job resolves its completion channel exactly once. Callers hold a
//! [`BusHandle`] and simply await their request; the handle is cheap to clone
//! and the queue discipline is the only synchronization on the shared bus.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use super::command::{BusCommand, Payload, PayloadError, ResponseCode};
use super::crc::crc16_is_valid;
use super::frame::{HexBytes, RawFrame, FRAME_LEN};
use super::node::Address;
use crate::iodev::{IoDevice, IoDirection, IoEvent};
use crate::tracing::prelude::*;

/// Total tries for a unicast request, first transmission included.
pub const MAX_ATTEMPTS: u8 = 3;

/// How long the bus stays in `Error` before resuming operation.
pub const ERROR_RECOVERY_INTERVAL: Duration = Duration::from_millis(50);

/// Externally visible bus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Transfer,
    Error,
}

/// Failures a bus request can resolve with.
#[derive(Debug, Error)]
pub enum BusError {
    /// No response arrived within the command's deadline, all attempts used.
    #[error("no response within the deadline")]
    Timeout,
    #[error("response failed the checksum")]
    Crc,
    #[error("short response, {avail} bytes readable")]
    ShortFrame { avail: usize },
    #[error("response carries the request flag")]
    UnexpectedRequest,
    #[error("response from node {got}, expected node {expected}")]
    WrongResponder { expected: Address, got: Address },
    #[error("unknown response code 0x{0:02x}")]
    InvalidResponseCode(u8),
    /// The node answered, but with a protocol error. Never retried.
    #[error("node reported: {0}")]
    Node(ResponseCode),
    #[error("malformed response payload: {0}")]
    Payload(#[from] PayloadError),
    /// The whole bus faulted while this job was active.
    #[error("bus fault")]
    Faulted,
    #[error("bus engine shut down")]
    Closed,
}

enum JobKind {
    Unicast {
        target: Address,
        timeout: Duration,
        attempts: u8,
        done: oneshot::Sender<Result<RawFrame, BusError>>,
    },
    Broadcast {
        done: oneshot::Sender<Result<(), BusError>>,
    },
}

struct Job {
    frame: RawFrame,
    kind: JobKind,
}

struct Submission {
    job: Job,
    high_priority: bool,
}

/// Spawns bus engines.
pub struct Bus;

impl Bus {
    /// Starts an engine task driving `device` and returns the caller handle.
    ///
    /// The engine runs until every handle is dropped.
    pub fn spawn<D>(device: D) -> BusHandle
    where
        D: IoDevice + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RwLock::new(BusState::Idle));
        let engine = Engine {
            device,
            queue: VecDeque::new(),
            state: BusState::Idle,
            shared: Arc::clone(&shared),
            watchdog: None,
            recover_at: None,
            rx,
        };
        tokio::spawn(engine.run());
        BusHandle { tx, state: shared }
    }
}

/// Caller-side handle to a bus engine.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::UnboundedSender<Submission>,
    state: Arc<RwLock<BusState>>,
}

impl BusHandle {
    /// Current bus state.
    pub fn state(&self) -> BusState {
        *self.state.read().unwrap()
    }

    /// Sends a unicast request and awaits its typed response.
    pub async fn send<C: BusCommand>(
        &self,
        target: Address,
        request: C::Request,
    ) -> Result<C::Response, BusError> {
        self.submit_unicast::<C>(target, request, false).await
    }

    /// Like [`send`](Self::send), but the job is serviced right after the
    /// transfer that is already on the wire, ahead of queued jobs.
    pub async fn send_high_priority<C: BusCommand>(
        &self,
        target: Address,
        request: C::Request,
    ) -> Result<C::Response, BusError> {
        self.submit_unicast::<C>(target, request, true).await
    }

    /// Sends a broadcast. Resolves when the transfer has left the adapter;
    /// nodes never answer broadcasts.
    pub async fn broadcast<C: BusCommand>(&self, request: C::Request) -> Result<(), BusError> {
        let frame = RawFrame::broadcast_request(C::ID, request.encode());
        let (done, rx) = oneshot::channel();
        let job = Job {
            frame,
            kind: JobKind::Broadcast { done },
        };
        self.tx
            .send(Submission {
                job,
                high_priority: false,
            })
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    /// Issues one unicast per node and collects every outcome.
    pub async fn send_for_all<C>(
        &self,
        nodes: &[Address],
        request: C::Request,
    ) -> Vec<(Address, Result<C::Response, BusError>)>
    where
        C: BusCommand,
        C::Request: Clone,
    {
        let requests = nodes.iter().map(|&node| {
            let request = request.clone();
            async move { (node, self.send::<C>(node, request).await) }
        });
        future::join_all(requests).await
    }

    async fn submit_unicast<C: BusCommand>(
        &self,
        target: Address,
        request: C::Request,
        high_priority: bool,
    ) -> Result<C::Response, BusError> {
        let frame = RawFrame::unicast_request(C::ID, target, request.encode());
        let (done, rx) = oneshot::channel();
        let job = Job {
            frame,
            kind: JobKind::Unicast {
                target,
                timeout: C::ID.response_timeout(),
                attempts: 0,
                done,
            },
        };
        self.tx
            .send(Submission { job, high_priority })
            .map_err(|_| BusError::Closed)?;
        let frame = rx.await.map_err(|_| BusError::Closed)??;
        Ok(C::Response::decode(&frame.payload)?)
    }
}

/// Sleeps until `at`, or forever when no deadline is armed.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Engine<D> {
    device: D,
    queue: VecDeque<Job>,
    state: BusState,
    shared: Arc<RwLock<BusState>>,
    /// Response deadline of the in-flight unicast.
    watchdog: Option<Instant>,
    /// End of the error recovery interval.
    recover_at: Option<Instant>,
    rx: mpsc::UnboundedReceiver<Submission>,
}

impl<D: IoDevice> Engine<D> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                submission = self.rx.recv() => match submission {
                    Some(s) => self.add_job(s.job, s.high_priority),
                    None => break,
                },
                event = self.device.event(), if self.state != BusState::Error => match event {
                    Ok(event) => self.on_event(event),
                    Err(err) => {
                        warn!(%err, "device error");
                        self.enter_error();
                    }
                },
                _ = deadline(self.watchdog) => self.on_watchdog(),
                _ = deadline(self.recover_at) => self.on_recovered(),
            }
        }
    }

    fn set_state(&mut self, state: BusState) {
        self.state = state;
        *self.shared.write().unwrap() = state;
    }

    fn add_job(&mut self, job: Job, high_priority: bool) {
        if high_priority {
            // Never preempt the active transfer: slot in right behind it.
            let in_flight = self.state == BusState::Transfer && !self.queue.is_empty();
            let at = if in_flight { 1 } else { 0 };
            self.queue.insert(at.min(self.queue.len()), job);
        } else {
            self.queue.push_back(job);
        }
        if self.state == BusState::Idle {
            self.start_front();
        }
    }

    /// Writes the front job to the device and arms its watchdog.
    fn start_front(&mut self) {
        let bytes = {
            let Some(job) = self.queue.front() else {
                self.set_state(BusState::Idle);
                return;
            };
            job.frame.to_bytes()
        };

        if self.device.write_room() < FRAME_LEN {
            warn!("device write buffer full");
            self.fail_front();
            self.fault_bus();
            return;
        }
        match self.device.write(&bytes) {
            Ok(n) if n == FRAME_LEN => {}
            Ok(n) => {
                warn!(written = n, "short device write");
                self.fail_front();
                self.fault_bus();
                return;
            }
            Err(err) => {
                warn!(%err, "device write failed");
                self.fail_front();
                self.fault_bus();
                return;
            }
        }
        trace!(frame = %HexBytes(&bytes), "bus tx");

        self.set_state(BusState::Transfer);
        match self.queue.front_mut().map(|job| &mut job.kind) {
            Some(JobKind::Unicast {
                timeout, attempts, ..
            }) => {
                *attempts += 1;
                self.watchdog = Some(Instant::now() + *timeout);
            }
            _ => self.watchdog = None,
        }
    }

    fn on_event(&mut self, event: IoEvent) {
        if self.state != BusState::Transfer || self.queue.is_empty() {
            warn!(?event, "device event while idle");
            self.enter_error();
            return;
        }
        let broadcast = matches!(
            self.queue.front().map(|job| &job.kind),
            Some(JobKind::Broadcast { .. })
        );
        match (event, broadcast) {
            (IoEvent::TransferComplete, true) => self.finish_broadcast(Ok(())),
            (IoEvent::TransferComplete, false) => {
                // The request left the adapter; the watchdog keeps running
                // until the response shows up.
            }
            (IoEvent::ReadyRead, false) => self.on_ready_read(),
            (IoEvent::ReadyRead, true) => {
                warn!("response received for a broadcast");
                self.enter_error();
            }
        }
    }

    /// Validates the buffered response for the in-flight unicast.
    fn on_ready_read(&mut self) {
        let target = match self.queue.front().map(|job| &job.kind) {
            Some(JobKind::Unicast { target, .. }) => *target,
            _ => {
                self.enter_error();
                return;
            }
        };

        let avail = self.device.bytes_to_read();
        if avail < FRAME_LEN {
            return self.fail_or_retry(BusError::ShortFrame { avail });
        }
        let mut bytes = [0u8; FRAME_LEN];
        match self.device.read(&mut bytes) {
            Ok(n) if n == FRAME_LEN => {}
            _ => return self.fail_or_retry(BusError::ShortFrame { avail }),
        }
        trace!(frame = %HexBytes(&bytes), "bus rx");

        if !crc16_is_valid(&bytes) {
            return self.fail_or_retry(BusError::Crc);
        }
        let frame = RawFrame::from_bytes(&bytes);
        if frame.request {
            return self.fail_or_retry(BusError::UnexpectedRequest);
        }
        if frame.address != target {
            return self.fail_or_retry(BusError::WrongResponder {
                expected: target,
                got: frame.address,
            });
        }
        match ResponseCode::from_repr(frame.code) {
            Some(ResponseCode::Ok) => self.finish_unicast(Ok(frame)),
            Some(code) => self.finish_unicast(Err(BusError::Node(code))),
            None => self.fail_or_retry(BusError::InvalidResponseCode(frame.code)),
        }
    }

    /// Retries the in-flight unicast, or resolves it with `error` once its
    /// attempts are used up.
    fn fail_or_retry(&mut self, error: BusError) {
        let attempts = match self.queue.front().map(|job| &job.kind) {
            Some(JobKind::Unicast { attempts, .. }) => *attempts,
            _ => {
                self.enter_error();
                return;
            }
        };
        if attempts < MAX_ATTEMPTS {
            debug!(%error, attempt = attempts, "retrying request");
            self.device.clear(IoDirection::Input);
            self.watchdog = None;
            self.start_front();
        } else {
            debug!(%error, "request failed, attempts exhausted");
            self.finish_unicast(Err(error));
        }
    }

    fn on_watchdog(&mut self) {
        self.watchdog = None;
        self.fail_or_retry(BusError::Timeout);
    }

    fn on_recovered(&mut self) {
        self.recover_at = None;
        debug!("bus recovered");
        self.set_state(BusState::Idle);
        if !self.queue.is_empty() {
            self.start_front();
        }
    }

    fn finish_unicast(&mut self, result: Result<RawFrame, BusError>) {
        if let Some(job) = self.queue.pop_front() {
            if let JobKind::Unicast { done, .. } = job.kind {
                let _ = done.send(result);
            }
        }
        self.advance_queue();
    }

    fn finish_broadcast(&mut self, result: Result<(), BusError>) {
        if let Some(job) = self.queue.pop_front() {
            if let JobKind::Broadcast { done } = job.kind {
                let _ = done.send(result);
            }
        }
        self.advance_queue();
    }

    fn advance_queue(&mut self) {
        self.watchdog = None;
        if self.queue.is_empty() {
            self.set_state(BusState::Idle);
        } else {
            self.start_front();
        }
    }

    /// Escalates to the `Error` state: the active job fails, buffers are
    /// dropped, and a timer brings the bus back to `Idle`.
    fn enter_error(&mut self) {
        if self.state == BusState::Transfer {
            self.fail_front();
        }
        self.fault_bus();
    }

    /// Resolves the front job with a bus fault, if one is queued.
    fn fail_front(&mut self) {
        if let Some(job) = self.queue.pop_front() {
            match job.kind {
                JobKind::Unicast { done, .. } => {
                    let _ = done.send(Err(BusError::Faulted));
                }
                JobKind::Broadcast { done } => {
                    let _ = done.send(Err(BusError::Faulted));
                }
            }
        }
    }

    fn fault_bus(&mut self) {
        self.device.clear(IoDirection::All);
        self.watchdog = None;
        self.set_state(BusState::Error);
        self.recover_at = Some(Instant::now() + ERROR_RECOVERY_INTERVAL);
        warn!(
            "bus fault, resuming in {} ms",
            ERROR_RECOVERY_INTERVAL.as_millis()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::command::{BlFlashErase, BlGetVersion, GetVersion, SwapDma};
    use crate::flasher::image::MemoryLayout;
    use crate::iodev::sim::{Behavior, SimBus, SimNode};

    fn addr(raw: u8) -> Address {
        Address::new(raw).unwrap()
    }

    fn test_layout() -> MemoryLayout {
        MemoryLayout {
            start: 0x2000,
            end: 0x2040,
            word_size: 2,
            row_size: 8,
            page_size: 0,
        }
    }

    // Scenario: a reachable node answers a unicast immediately.
    #[tokio::test(start_paused = true)]
    async fn unicast_resolves_with_the_typed_response() {
        let sim = SimBus::new(vec![
            SimNode::new(addr(7), test_layout()).with_version(0x0002_0001)
        ]);
        let bus = Bus::spawn(sim.clone());

        let version = bus.send::<GetVersion>(addr(7), ()).await.unwrap();
        assert_eq!(version, 0x0002_0001);
        assert_eq!(bus.state(), BusState::Idle);
        // Completed jobs leave the queue; nothing is resent.
        assert_eq!(sim.written_frames().len(), 1);
    }

    // Scenario: the target never answers within the bootloader timeout.
    #[tokio::test(start_paused = true)]
    async fn unresponsive_node_times_out_after_three_attempts() {
        let sim = SimBus::new(vec![]);
        let bus = Bus::spawn(sim.clone());

        let err = bus.send::<BlGetVersion>(addr(3), ()).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout));
        assert_eq!(sim.written_frames().len(), MAX_ATTEMPTS as usize);
        assert_eq!(bus.state(), BusState::Idle);
    }

    // Scenario: a broadcast resolves on transfer completion alone.
    #[tokio::test(start_paused = true)]
    async fn broadcast_resolves_on_transfer_complete() {
        let sim = SimBus::new(vec![
            SimNode::new(addr(0), test_layout()),
            SimNode::new(addr(1), test_layout()),
        ]);
        let bus = Bus::spawn(sim.clone());

        bus.broadcast::<SwapDma>(()).await.unwrap();

        let frames = sim.written_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].broadcast);
        assert_eq!(bus.state(), BusState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_jobs_cut_in_behind_the_active_transfer() {
        let sim = SimBus::new(vec![
            SimNode::new(addr(5), test_layout()),
            SimNode::new(addr(6), test_layout()),
        ]);
        let bus = Bus::spawn(sim.clone());

        // Node 1 is absent, so this job occupies the bus for three attempts
        // while the other two wait in the queue.
        let stuck = bus.send::<GetVersion>(addr(1), ());
        let queued = bus.send::<GetVersion>(addr(5), ());
        let urgent = bus.send_high_priority::<GetVersion>(addr(6), ());
        let (stuck, queued, urgent) = tokio::join!(stuck, queued, urgent);

        assert!(matches!(stuck, Err(BusError::Timeout)));
        assert!(queued.is_ok());
        assert!(urgent.is_ok());

        let order: Vec<u8> = sim
            .written_frames()
            .iter()
            .map(|f| f.address.value())
            .collect();
        assert_eq!(order, [1, 1, 1, 6, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_responses_are_retried_then_surface_as_crc_errors() {
        let sim = SimBus::new(vec![
            SimNode::new(addr(4), test_layout()).with_behavior(Behavior::CorruptCrc)
        ]);
        let bus = Bus::spawn(sim.clone());

        let err = bus.send::<GetVersion>(addr(4), ()).await.unwrap_err();
        assert!(matches!(err, BusError::Crc));
        assert_eq!(sim.written_frames().len(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_responder_is_a_bus_error() {
        let sim = SimBus::new(vec![
            SimNode::new(addr(4), test_layout()).with_behavior(Behavior::WrongResponder)
        ]);
        let bus = Bus::spawn(sim.clone());

        let err = bus.send::<GetVersion>(addr(4), ()).await.unwrap_err();
        match err {
            BusError::WrongResponder { expected, got } => {
                assert_eq!(expected, addr(4));
                assert_eq!(got, addr(5));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // Node-reported protocol errors resolve immediately, without retries.
    #[tokio::test(start_paused = true)]
    async fn node_errors_are_not_retried() {
        let sim = SimBus::new(vec![SimNode::new(addr(2), test_layout())]);
        let bus = Bus::spawn(sim.clone());

        // A bootloader command against running firmware is rejected.
        let err = bus.send::<BlFlashErase>(addr(2), ()).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Node(ResponseCode::InvalidCommand)
        ));
        assert_eq!(sim.written_frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_bytes_fault_the_bus_until_recovery() {
        let sim = SimBus::new(vec![SimNode::new(addr(5), test_layout())]);
        let bus = Bus::spawn(sim.clone());

        sim.inject_bytes(&[0xde, 0xad]);
        // Let the engine observe the noise; the paused clock cannot advance
        // while this task keeps yielding, so the fault state is visible.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.state(), BusState::Error);

        // Work submitted during the fault runs once the bus recovered.
        let version = bus.send::<GetVersion>(addr(5), ()).await;
        assert!(version.is_ok());
        assert_eq!(bus.state(), BusState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failures_fail_the_active_job_and_recover() {
        let sim = SimBus::new(vec![SimNode::new(addr(5), test_layout())]);
        let bus = Bus::spawn(sim.clone());

        sim.set_write_failure(true);
        let err = bus.send::<GetVersion>(addr(5), ()).await.unwrap_err();
        assert!(matches!(err, BusError::Faulted));

        sim.set_write_failure(false);
        let version = bus.send::<GetVersion>(addr(5), ()).await;
        assert!(version.is_ok());
        assert_eq!(bus.state(), BusState::Idle);
    }
}
