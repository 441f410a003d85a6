//! A single-threaded FIFO job queue. Compaction sweeps run here, off the
//! caller's thread, strictly in submission order; a job can return
//! `Reschedule` to retry itself rather than blocking the worker on an
//! external condition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A unit of work the scheduler runs on its worker thread. Returning
/// `Reschedule` re-invokes the job immediately instead of dropping it, so a
/// job can wait on an external condition without blocking the worker or
/// spawning its own thread.
pub enum Outcome {
    Done,
    Reschedule,
}

/// A job is handed the scheduler's cancellation flag on every invocation, so
/// a long-running job (a compaction sweep) can check it mid-loop and stop
/// mutating the backend as soon as `Close`/`Stop` fires, not just between
/// jobs.
pub type Job = Box<dyn FnMut(&AtomicBool) -> Outcome + Send>;

enum Message {
    Run(Job),
    Stop,
}

/// A single-worker FIFO scheduler. Dropping it detaches the worker thread
/// after draining whatever is already queued; call `stop` to cancel
/// outstanding jobs instead.
pub struct Scheduler {
    sender: Sender<Message>,
    canceled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Message>();
        let canceled = Arc::new(AtomicBool::new(false));
        let worker_canceled = canceled.clone();

        let worker = std::thread::Builder::new()
            .name("mvcc-scheduler".into())
            .spawn(move || {
                for msg in receiver {
                    match msg {
                        // Always honored regardless of `canceled`: this is
                        // the only way the worker loop ever exits, so it must
                        // not be gated behind the same flag `stop` sets
                        // immediately before sending it.
                        Message::Stop => break,
                        Message::Run(mut job) => loop {
                            if worker_canceled.load(Ordering::Acquire) {
                                break;
                            }
                            match job(&worker_canceled) {
                                Outcome::Done => break,
                                Outcome::Reschedule => continue,
                            }
                        },
                    }
                }
            })
            .expect("failed to spawn scheduler worker thread");

        Scheduler { sender, canceled, worker: Some(worker) }
    }

    /// Submits `job` to run after everything already queued. Silently
    /// dropped if the scheduler has been stopped.
    pub fn schedule(&self, job: Job) {
        let _ = self.sender.send(Message::Run(job));
    }

    /// Cancels outstanding and in-flight reschedule loops, then waits for the
    /// worker thread to exit. A job already invoked finishes its current call
    /// before observing cancellation; a job not yet started when cancellation
    /// lands is skipped without ever being invoked.
    pub fn stop(mut self) {
        self.canceled.store(true, Ordering::Release);
        let _ = self.sender.send(Message::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel();

        for i in 0..5 {
            let tx = tx.clone();
            scheduler.schedule(Box::new(move |_cancel| {
                tx.send(i).unwrap();
                Outcome::Done
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        scheduler.stop();
    }

    #[test]
    fn a_job_can_reschedule_itself_until_a_condition_holds() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel();
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let job_attempts = attempts.clone();

        scheduler.schedule(Box::new(move |_cancel| {
            let n = job_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                return Outcome::Reschedule;
            }
            tx.send(n).unwrap();
            Outcome::Done
        }));

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result, 3);
        scheduler.stop();
    }

    #[test]
    fn stop_joins_the_worker_instead_of_hanging() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel();
        scheduler.schedule(Box::new(move |_cancel| {
            tx.send(()).unwrap();
            Outcome::Done
        }));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        // The regression under test: this must return, not hang forever
        // waiting on a worker that never breaks its receive loop.
        scheduler.stop();
    }

    #[test]
    fn a_running_job_observes_cancellation_mid_loop() {
        let scheduler = Scheduler::new();
        let (started_tx, started_rx) = channel();
        let (stopped_tx, stopped_rx) = channel();

        scheduler.schedule(Box::new(move |cancel| {
            started_tx.send(()).unwrap();
            while !cancel.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
            stopped_tx.send(()).unwrap();
            Outcome::Done
        }));

        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        scheduler.stop();
        stopped_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }
}
