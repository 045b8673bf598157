//! The state machine itself (spec §4.G). `Job::step` is a plain,
//! synchronous function from `(state, event)` to the next thing the
//! driver should do; it never touches the network or a clock, so the
//! transition table is testable without a runtime. `Job::drive` is the
//! thin async loop that actually awaits `proto::Handler` calls and the
//! retry timer, feeding their outcomes back into `step`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Result, ScanError, ScanStatus};
use crate::http::HttpClient;
use crate::model::{Device, ScanParams};
use crate::proto::{CheckOutcome, Handler, LoadOutcome};

/// Default retry budget: `CHECK` may ask for a retry up to this many
/// times, spaced `DEFAULT_RETRY_DELAY` apart (spec §4.G).
pub const DEFAULT_RETRY_LIMIT: u32 = 30;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Devcaps,
    Precheck,
    Scan,
    Load,
    Check,
    Cleanup,
    Cancel,
    Finished,
}

/// Every fallible operation result, plus timer and cancel
/// notifications, arrives as one of these. Keeping HTTP completions
/// and timer fires in a single enum is what lets `step` stay
/// synchronous (spec §9, "route callbacks through the event loop").
pub enum JobEvent {
    Start,
    DevcapsDone(Result<()>),
    PrecheckDone(Result<()>),
    ScanDone(Result<String>),
    LoadDone(Result<LoadOutcome>),
    CheckDone(Result<CheckOutcome>),
    CleanupDone(Result<()>),
    CancelDone(Result<()>),
    /// Re-enter `LOAD` after a page has been handed to the caller.
    ContinueLoad,
    TimerFired,
    CancelRequested,
}

/// What the driver should do in response to a `step` call.
#[derive(Debug)]
pub enum StepOutcome {
    RunDevcaps,
    RunPrecheck,
    RunScan,
    RunLoad,
    RunCheck,
    RunCleanup,
    RunCancel,
    Sleep(Duration),
    Page(Vec<u8>),
    Done(ScanStatus),
    /// The event didn't change anything the driver needs to act on
    /// (e.g. a redundant cancel while already cancelling).
    Noop,
}

/// One in-flight (or finished) scan job.
pub struct Job {
    device: Device,
    params: ScanParams,
    state: State,
    location: String,
    retry_count: u32,
    retry_limit: u32,
    retry_delay: Duration,
    pages_delivered: u32,
    pending_status: Option<ScanStatus>,
    cancel: Arc<AtomicBool>,
}

impl Job {
    pub fn new(device: Device, params: ScanParams) -> Self {
        Self {
            device,
            params,
            state: State::Idle,
            location: String::new(),
            retry_count: 0,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            pages_delivered: 0,
            pending_status: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry_policy(mut self, limit: u32, delay: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_delay = delay;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// A clone of the cancel flag, safe to set from signal context
    /// (spec §5, "the sole entry point that must be safe from signal
    /// context"). Setting it only takes effect at the job's next step.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// `true` once the job has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Advance the machine by one event. Pure and synchronous: no
    /// network access, no clock reads, so unit tests can drive it
    /// directly without a runtime.
    pub fn step(&mut self, event: JobEvent) -> StepOutcome {
        use JobEvent::*;
        use State::*;

        match (self.state, event) {
            (Idle, Start) => {
                self.state = Devcaps;
                debug!(device = %self.device.name, "devcaps");
                StepOutcome::RunDevcaps
            }

            (Devcaps, DevcapsDone(Ok(()))) => {
                self.state = Precheck;
                StepOutcome::RunPrecheck
            }
            (Devcaps, DevcapsDone(Err(e))) => self.fail_or_check(e),

            (Precheck, PrecheckDone(Ok(()))) => {
                self.state = Scan;
                StepOutcome::RunScan
            }
            (Precheck, PrecheckDone(Err(e))) => self.fail_or_check(e),

            (Scan, ScanDone(Ok(location))) => {
                self.location = location;
                self.state = Load;
                StepOutcome::RunLoad
            }
            (Scan, ScanDone(Err(e))) => self.fail_or_check(e),

            (Load, LoadDone(Ok(LoadOutcome::Page(bytes)))) => {
                self.pages_delivered += 1;
                StepOutcome::Page(bytes)
            }
            (Load, ContinueLoad) => StepOutcome::RunLoad,
            (Load, LoadDone(Ok(LoadOutcome::Done))) => {
                let status = if self.pages_delivered > 0 {
                    ScanStatus::Good
                } else {
                    ScanStatus::NoDocs
                };
                self.finish_or_cleanup(status)
            }
            (Load, LoadDone(Err(e))) => self.fail_or_check(e),

            (Check, CheckDone(Ok(CheckOutcome::RetryAfter(delay)))) => self.retry_or_give_up(delay),
            (Check, CheckDone(Ok(CheckOutcome::Status(s)))) => self.finish_or_cleanup(s),
            (Check, CheckDone(Err(e))) => {
                let status = e.status();
                self.finish_or_cleanup(status)
            }
            (Check, TimerFired) => {
                self.state = Scan;
                StepOutcome::RunScan
            }

            (Cleanup, CleanupDone(_)) => {
                let status = self.pending_status.unwrap_or(ScanStatus::IoError);
                self.final_done(status)
            }

            (Cancel, CancelDone(_)) => self.final_done(ScanStatus::Cancelled),
            (Cancel, CancelRequested) => StepOutcome::Noop,

            (Finished, _) => StepOutcome::Done(self.pending_status.unwrap_or(ScanStatus::Cancelled)),

            (_, CancelRequested) => {
                self.state = Cancel;
                if self.location.is_empty() {
                    self.final_done(ScanStatus::Cancelled)
                } else {
                    StepOutcome::RunCancel
                }
            }

            (state, _unexpected) => {
                warn!(?state, "job state machine received an event it doesn't expect in this state");
                StepOutcome::Noop
            }
        }
    }

    /// Pure transport failures skip `CHECK` entirely and finish with
    /// `IO_ERROR` (spec §4.G invariant); anything that produced a
    /// decodable status (an HTTP error code, a protocol fault, a
    /// device status) routes through `CHECK` like any other error.
    fn fail_or_check(&mut self, e: ScanError) -> StepOutcome {
        if matches!(e, ScanError::Transport(_)) {
            warn!(error = %e, "transport failure, skipping check");
            self.final_done(ScanStatus::IoError)
        } else {
            debug!(error = %e, "operation failed, routing through check");
            self.state = State::Check;
            StepOutcome::RunCheck
        }
    }

    fn retry_or_give_up(&mut self, delay: Duration) -> StepOutcome {
        if self.retry_count >= self.retry_limit {
            warn!(retries = self.retry_count, "retry budget exhausted");
            self.final_done(ScanStatus::IoError)
        } else {
            self.retry_count += 1;
            StepOutcome::Sleep(delay)
        }
    }

    /// Terminal status reached, but `location` may still need to be
    /// torn down on the device first (spec §4.G invariant).
    fn finish_or_cleanup(&mut self, status: ScanStatus) -> StepOutcome {
        self.pending_status = Some(status);
        if self.location.is_empty() {
            self.state = State::Finished;
            StepOutcome::Done(status)
        } else {
            self.state = State::Cleanup;
            StepOutcome::RunCleanup
        }
    }

    fn final_done(&mut self, status: ScanStatus) -> StepOutcome {
        self.state = State::Finished;
        self.pending_status = Some(status);
        StepOutcome::Done(status)
    }

    /// If cancel was requested while `real_event`'s operation was in
    /// flight, discard its result and fold in the cancel instead (spec
    /// §5, "cancels the in-flight HTTP query, its callback is
    /// suppressed").
    fn gate(&mut self, real_event: JobEvent) -> StepOutcome {
        if self.cancel.load(Ordering::Relaxed) && self.state != State::Cancel && self.state != State::Finished {
            self.step(JobEvent::CancelRequested)
        } else {
            self.step(real_event)
        }
    }

    /// Drive the job to completion, performing the real handler calls
    /// and timers that `step` only describes. Pages are streamed out
    /// through `pages_tx` as they're decoded; the return value is the
    /// job's final status.
    pub async fn drive(
        &mut self,
        http: &HttpClient,
        handler: &mut Handler,
        pages_tx: &mpsc::Sender<Vec<u8>>,
    ) -> ScanStatus {
        let mut outcome = self.step(JobEvent::Start);
        loop {
            outcome = match outcome {
                StepOutcome::RunDevcaps => {
                    let r = handler.devcaps(http, &self.device).await.map(|_| ());
                    self.gate(JobEvent::DevcapsDone(r))
                }
                StepOutcome::RunPrecheck => {
                    let r = handler.precheck(http, &self.device).await;
                    self.gate(JobEvent::PrecheckDone(r))
                }
                StepOutcome::RunScan => {
                    let r = handler.scan(http, &self.device, &self.params).await;
                    self.gate(JobEvent::ScanDone(r))
                }
                StepOutcome::RunLoad => {
                    let r = handler.load(http, &self.device, &self.location).await;
                    self.gate(JobEvent::LoadDone(r))
                }
                StepOutcome::RunCheck => {
                    let r = handler
                        .check(http, &self.device, &self.location, self.retry_count)
                        .await;
                    self.gate(JobEvent::CheckDone(r))
                }
                StepOutcome::RunCleanup => {
                    let r = handler.cleanup(http, &self.device, &self.location).await;
                    self.step(JobEvent::CleanupDone(r))
                }
                StepOutcome::RunCancel => {
                    let r = handler.cancel(http, &self.device, &self.location).await;
                    self.step(JobEvent::CancelDone(r))
                }
                StepOutcome::Sleep(delay) => {
                    sleep(delay).await;
                    self.gate(JobEvent::TimerFired)
                }
                StepOutcome::Page(bytes) => {
                    if pages_tx.send(bytes).await.is_err() {
                        warn!("page receiver dropped, cancelling job");
                        self.cancel.store(true, Ordering::Relaxed);
                    }
                    self.gate(JobEvent::ContinueLoad)
                }
                StepOutcome::Done(status) => return status,
                StepOutcome::Noop => {
                    // Only reachable on a redundant cancel; the state
                    // didn't move, so there's nothing left to drive.
                    return self.pending_status.unwrap_or(ScanStatus::Cancelled);
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColorMode, ImageFormat, ScanIntent, ScanSource};

    fn params() -> ScanParams {
        ScanParams {
            source: ScanSource::Platen,
            color_mode: ColorMode::Color,
            intent: ScanIntent::Document,
            format: ImageFormat::Jpeg,
            x_res: 300,
            y_res: 300,
            x_off: 0,
            y_off: 0,
            width: 2550,
            height: 3300,
        }
    }

    fn job() -> Job {
        Job::new(Device::new("test-scanner", "uuid:1"), params())
    }

    /// Scenario 1: eSCL platen JPEG, DEVCAPS -> SCAN -> LOAD -> FINISH.
    #[test]
    fn platen_single_page_finishes_good() {
        let mut j = job();
        assert!(matches!(j.step(JobEvent::Start), StepOutcome::RunDevcaps));
        assert!(matches!(
            j.step(JobEvent::DevcapsDone(Ok(()))),
            StepOutcome::RunPrecheck
        ));
        assert!(matches!(
            j.step(JobEvent::PrecheckDone(Ok(()))),
            StepOutcome::RunScan
        ));
        assert!(matches!(
            j.step(JobEvent::ScanDone(Ok("http://dev/jobs/abc".into()))),
            StepOutcome::RunLoad
        ));
        match j.step(JobEvent::LoadDone(Ok(LoadOutcome::Page(vec![1, 2, 3]))))
        {
            StepOutcome::Page(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("expected a page"),
        }
        assert!(matches!(j.step(JobEvent::ContinueLoad), StepOutcome::RunLoad));
        // cleanup since location is set
        assert!(matches!(
            j.step(JobEvent::LoadDone(Ok(LoadOutcome::Done))),
            StepOutcome::RunCleanup
        ));
        match j.step(JobEvent::CleanupDone(Ok(()))) {
            StepOutcome::Done(ScanStatus::Good) => {}
            _ => panic!("expected a final GOOD status"),
        }
        assert!(j.is_finished());
    }

    /// Scenario 2: WSD ADF, two pages then a NO_DOCS fault via CHECK.
    #[test]
    fn adf_two_pages_then_no_docs() {
        let mut j = job();
        j.step(JobEvent::Start);
        j.step(JobEvent::DevcapsDone(Ok(())));
        j.step(JobEvent::PrecheckDone(Ok(())));
        j.step(JobEvent::ScanDone(Ok("17:T".into())));
        j.step(JobEvent::LoadDone(Ok(LoadOutcome::Page(vec![0xff]))));
        j.step(JobEvent::ContinueLoad);
        j.step(JobEvent::LoadDone(Ok(LoadOutcome::Page(vec![0xfe]))));
        assert!(matches!(j.step(JobEvent::ContinueLoad), StepOutcome::RunLoad));
        let err = ScanError::Device(ScanStatus::NoDocs);
        assert!(matches!(
            j.step(JobEvent::LoadDone(Err(err))),
            StepOutcome::RunCheck
        ));
        assert!(matches!(
            j.step(JobEvent::CheckDone(Ok(CheckOutcome::Status(ScanStatus::NoDocs)))),
            StepOutcome::RunCleanup
        ));
        match j.step(JobEvent::CleanupDone(Ok(()))) {
            StepOutcome::Done(ScanStatus::NoDocs) => {}
            other => panic!("expected NO_DOCS, got a different outcome ({other:?})"),
        }
        assert_eq!(j.pages_delivered, 2);
    }

    /// Scenario 3: lamp warming retries SCAN up to the budget, then
    /// terminates with IO_ERROR.
    #[test]
    fn lamp_warming_exhausts_retry_budget() {
        let mut j = job().with_retry_policy(2, Duration::from_millis(1));
        j.step(JobEvent::Start);
        j.step(JobEvent::DevcapsDone(Ok(())));
        j.step(JobEvent::PrecheckDone(Ok(())));
        let fault = ScanError::Protocol("LampWarming".into());
        assert!(matches!(j.step(JobEvent::ScanDone(Err(fault))), StepOutcome::RunCheck));

        for _ in 0..2 {
            let outcome = j.step(JobEvent::CheckDone(Ok(CheckOutcome::RetryAfter(
                Duration::from_millis(1000),
            ))));
            assert!(matches!(outcome, StepOutcome::Sleep(_)));
            assert!(matches!(j.step(JobEvent::TimerFired), StepOutcome::RunScan));
            let fault = ScanError::Protocol("LampWarming".into());
            j.step(JobEvent::ScanDone(Err(fault)));
        }

        match j.step(JobEvent::CheckDone(Ok(CheckOutcome::RetryAfter(
            Duration::from_millis(1000),
        )))) {
            StepOutcome::Done(ScanStatus::IoError) => {}
            other => panic!("expected IO_ERROR once the budget is exhausted, got {other:?}"),
        }
    }

    /// `DeviceBusy` is a terminal CHECK outcome, not a retry trigger —
    /// only an explicit `RetryAfter` (calibrating/lamp-warming) spends
    /// the retry budget.
    #[test]
    fn device_busy_terminates_without_retrying() {
        let mut j = job();
        j.step(JobEvent::Start);
        j.step(JobEvent::DevcapsDone(Ok(())));
        j.step(JobEvent::PrecheckDone(Ok(())));
        let fault = ScanError::Device(ScanStatus::DeviceBusy);
        assert!(matches!(j.step(JobEvent::ScanDone(Err(fault))), StepOutcome::RunCheck));
        match j.step(JobEvent::CheckDone(Ok(CheckOutcome::Status(ScanStatus::DeviceBusy)))) {
            StepOutcome::Done(ScanStatus::DeviceBusy) => {}
            other => panic!("expected DEVICE_BUSY to terminate directly, got {other:?}"),
        }
        assert_eq!(j.retry_count, 0);
    }

    #[test]
    fn transport_failure_skips_check() {
        let mut j = job();
        j.step(JobEvent::Start);
        let e = ScanError::Transport(Box::new(std::io::Error::other("connection refused")));
        match j.step(JobEvent::DevcapsDone(Err(e))) {
            StepOutcome::Done(ScanStatus::IoError) => {}
            other => panic!("expected a direct IO_ERROR finish, got {other:?}"),
        }
        assert!(j.is_finished());
    }

    /// Scenario 6: cancelling mid-LOAD routes through CANCEL, not
    /// through whatever LOAD was about to report.
    #[test]
    fn cancel_mid_load_suppresses_the_pending_result() {
        let mut j = job();
        j.step(JobEvent::Start);
        j.step(JobEvent::DevcapsDone(Ok(())));
        j.step(JobEvent::PrecheckDone(Ok(())));
        j.step(JobEvent::ScanDone(Ok("17:T".into())));
        j.cancel.store(true, Ordering::Relaxed);
        // the driver would normally feed LoadDone here; instead it
        // notices the flag and substitutes CancelRequested.
        assert!(matches!(j.gate(JobEvent::LoadDone(Ok(LoadOutcome::Page(vec![1])))), StepOutcome::RunCancel));
        match j.step(JobEvent::CancelDone(Ok(()))) {
            StepOutcome::Done(ScanStatus::Cancelled) => {}
            other => panic!("expected CANCELLED, got {other:?}"),
        }
        assert_eq!(j.pages_delivered, 0);
    }

    #[test]
    fn cancel_before_any_location_skips_the_cancel_query() {
        let mut j = job();
        j.step(JobEvent::Start);
        match j.step(JobEvent::CancelRequested) {
            StepOutcome::Done(ScanStatus::Cancelled) => {}
            other => panic!("expected an immediate CANCELLED finish, got {other:?}"),
        }
    }

    #[test]
    fn finished_state_is_idempotent() {
        let mut j = job();
        j.step(JobEvent::Start);
        let e = ScanError::Transport(Box::new(std::io::Error::other("down")));
        j.step(JobEvent::DevcapsDone(Err(e)));
        assert!(j.is_finished());
        match j.step(JobEvent::CancelRequested) {
            StepOutcome::Done(ScanStatus::IoError) => {}
            other => panic!("a finished job should keep reporting its final status, got {other:?}"),
        }
    }
}
