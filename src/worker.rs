//! Runs session operations off the caller's thread.
//!
//! The session moves onto a worker thread; requests go in over one channel
//! and progress/results come back over another. One request may be in
//! flight at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::chips::{FuseKind, MemoryKind};
use crate::error::{HvppError, HvppResult};
use crate::memory::MemoryImage;
use crate::protocols::FuseBytes;
use crate::session::{OperationObserver, ProgrammerSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadSignature,
    VerifySignature,
    ReadFuses,
    ReadFuse(FuseKind),
    WriteFuse(FuseKind, u8),
    ReadCalibration,
    Erase,
    WriteLock(u8),
    ReadLog,
    ReadMemory(MemoryKind),
    WriteMemory(MemoryKind, MemoryImage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Signature([u8; 3]),
    Fuses(FuseBytes),
    Byte(u8),
    Log(String),
    Memory(Vec<u8>),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Progress { done: usize, total: usize },
    Finished(HvppResult<Response>),
}

pub struct SessionWorker {
    requests: Option<mpsc::Sender<Request>>,
    events: mpsc::Receiver<WorkerEvent>,
    busy: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<ProgrammerSession>>,
}

struct ChannelObserver<'a> {
    events: &'a mpsc::Sender<WorkerEvent>,
    cancel: &'a AtomicBool,
}

impl OperationObserver for ChannelObserver<'_> {
    fn progress(&mut self, done: usize, total: usize) {
        let _ = self.events.send(WorkerEvent::Progress { done, total });
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

fn execute(
    session: &mut ProgrammerSession,
    request: Request,
    observer: &mut dyn OperationObserver,
) -> HvppResult<Response> {
    match request {
        Request::ReadSignature => session.read_signature().map(Response::Signature),
        Request::VerifySignature => session.verify_signature().map(Response::Signature),
        Request::ReadFuses => session.read_fuses().map(Response::Fuses),
        Request::ReadFuse(kind) => session.read_fuse(kind).map(Response::Byte),
        Request::WriteFuse(kind, value) => session.write_fuse(kind, value).map(|_| Response::Done),
        Request::ReadCalibration => session.read_calibration().map(Response::Byte),
        Request::Erase => session.erase().map(|_| Response::Done),
        Request::WriteLock(value) => session.write_lock(value).map(|_| Response::Done),
        Request::ReadLog => session.read_log().map(Response::Log),
        Request::ReadMemory(memory) => session
            .read_memory(memory, observer)
            .map(Response::Memory),
        Request::WriteMemory(memory, image) => session
            .write_memory(memory, &image, observer)
            .map(|_| Response::Done),
    }
}

impl SessionWorker {
    pub fn spawn(mut session: ProgrammerSession) -> Self {
        let (requests, request_rx) = mpsc::channel::<Request>();
        let (event_tx, events) = mpsc::channel();
        let busy = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_busy = Arc::clone(&busy);
        let worker_cancel = Arc::clone(&cancel);

        let handle = thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                debug!("Worker running {:?}", request);
                let result = if worker_cancel.load(Ordering::SeqCst) {
                    Err(HvppError::Cancelled)
                } else {
                    let mut observer = ChannelObserver {
                        events: &event_tx,
                        cancel: &worker_cancel,
                    };
                    execute(&mut session, request, &mut observer)
                };

                // Freed before the result is sent, so a caller returning
                // from `wait` can submit straight away
                worker_busy.store(false, Ordering::SeqCst);
                if event_tx.send(WorkerEvent::Finished(result)).is_err() {
                    break;
                }
            }

            info!("Worker thread terminated.");
            session
        });

        SessionWorker {
            requests: Some(requests),
            events,
            busy,
            cancel,
            handle: Some(handle),
        }
    }

    /// Queue `request`, or fail with `SessionBusy` if one is still running
    pub fn submit(&self, request: Request) -> HvppResult<()> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(HvppError::SessionBusy);
        }
        self.cancel.store(false, Ordering::SeqCst);

        let sent = self
            .requests
            .as_ref()
            .map(|requests| requests.send(request).is_ok())
            .unwrap_or(false);
        if !sent {
            self.busy.store(false, Ordering::SeqCst);
            return Err(HvppError::NotConnected);
        }
        Ok(())
    }

    /// False once the worker has finished a request. Its `Finished` event
    /// may still be on its way; collect it before submitting again.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Ask the running request to stop before its next command is sent
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn try_recv(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Block until the running request finishes, passing progress to `on_progress`
    pub fn wait(&self, mut on_progress: impl FnMut(usize, usize)) -> HvppResult<Response> {
        loop {
            match self.events.recv() {
                Ok(WorkerEvent::Progress { done, total }) => on_progress(done, total),
                Ok(WorkerEvent::Finished(result)) => return result,
                Err(_) => return Err(HvppError::NotConnected),
            }
        }
    }

    /// Stop the worker thread and hand the session back
    pub fn shutdown(mut self) -> Option<ProgrammerSession> {
        self.requests.take();
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
