use crate::error::CompareError;
use crate::grid::ResultGrid;
use crate::loader::UploadedFile;
use crate::login::User;
use crate::pipeline::{CancelToken, CompareRequest, Stage};
use crate::presenter::{TableView, present};
use serde::Serialize;
use tokio::task::AbortHandle;

pub const MISSING_INPUTS_MESSAGE: &str = "Please select both files and a script";
pub const COMPLETE_MESSAGE: &str = "Comparison complete!";

/// Which page the session is showing
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    /// No identity callback has arrived yet
    Loading,
    Unauthenticated,
    Authenticated(User),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Empty,
    Ready,
    Processing,
    Complete,
    Failed,
}

/// File input slot on the comparison form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub fn parse(value: &str) -> Option<Slot> {
        match value {
            "1" | "file1" | "first" => Some(Slot::First),
            "2" | "file2" | "second" => Some(Slot::Second),
            _ => None,
        }
    }
}

struct Job {
    generation: u64,
    cancel: CancelToken,
    abort: Option<AbortHandle>,
}

impl Job {
    fn stop(self) {
        self.cancel.cancel();
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

/// A comparison accepted by [`SessionShell::begin_compare`]
pub struct StartedCompare {
    pub generation: u64,
    pub request: CompareRequest,
    pub cancel: CancelToken,
}

/// Per-session state of the comparison page
///
/// Every compare gets a generation number. Results, progress and failures
/// for any generation other than the running one are discarded, so clear,
/// sign-out or a newer compare can never be overwritten by a late result.
pub struct SessionShell {
    view: View,
    first: Option<UploadedFile>,
    second: Option<UploadedFile>,
    script: Option<String>,
    phase: Phase,
    status: String,
    grid: ResultGrid,
    generation: u64,
    job: Option<Job>,
}

impl Default for SessionShell {
    fn default() -> Self {
        SessionShell::new()
    }
}

impl SessionShell {
    pub fn new() -> Self {
        SessionShell {
            view: View::Loading,
            first: None,
            second: None,
            script: None,
            phase: Phase::Empty,
            status: String::new(),
            grid: ResultGrid::empty(),
            generation: 0,
            job: None,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn user(&self) -> Option<&User> {
        match &self.view {
            View::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn grid(&self) -> &ResultGrid {
        &self.grid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn export_enabled(&self) -> bool {
        !self.grid.is_empty()
    }

    /// Apply an identity callback. `None` means signed out or expired.
    pub fn identity_changed(&mut self, user: Option<User>) {
        match (user, &self.view) {
            (Some(user), View::Authenticated(current)) if current.uid == user.uid => {
                self.view = View::Authenticated(user);
            }
            (Some(user), _) => {
                self.reset_form();
                log::info!("session authenticated as {}", user.email);
                self.view = View::Authenticated(user);
            }
            (None, View::Unauthenticated) => {}
            (None, _) => {
                self.reset_form();
                self.view = View::Unauthenticated;
            }
        }
    }

    pub fn select_file(&mut self, slot: Slot, file: UploadedFile) {
        match slot {
            Slot::First => self.first = Some(file),
            Slot::Second => self.second = Some(file),
        }
        self.refresh_phase();
    }

    pub fn select_script(&mut self, key: &str) {
        let key = key.trim();
        self.script = if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        };
        self.refresh_phase();
    }

    pub fn file_name(&self, slot: Slot) -> Option<&str> {
        let file = match slot {
            Slot::First => self.first.as_ref(),
            Slot::Second => self.second.as_ref(),
        };
        file.map(|f| f.name.as_str())
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Start a comparison with the current inputs
    ///
    /// Returns `None` and sets the validation message when an input is
    /// missing; nothing else changes. Otherwise any running comparison is
    /// cancelled and the new one becomes current.
    pub fn begin_compare(&mut self) -> Option<StartedCompare> {
        if !matches!(self.view, View::Authenticated(_)) {
            return None;
        }
        let (Some(first), Some(second), Some(script)) =
            (self.first.clone(), self.second.clone(), self.script.clone())
        else {
            self.status = MISSING_INPUTS_MESSAGE.to_string();
            return None;
        };

        self.stop_job();
        self.generation += 1;
        let cancel = CancelToken::new();
        self.job = Some(Job {
            generation: self.generation,
            cancel: cancel.clone(),
            abort: None,
        });
        self.phase = Phase::Processing;
        self.status = Stage::Reading.status().to_string();

        Some(StartedCompare {
            generation: self.generation,
            request: CompareRequest {
                first,
                second,
                script,
            },
            cancel,
        })
    }

    /// Remember the task running `generation` so it can be aborted.
    /// Returns false (and aborts the handle) when that generation is no
    /// longer current.
    pub fn attach_task(&mut self, generation: u64, abort: AbortHandle) -> bool {
        match self.job.as_mut() {
            Some(job) if job.generation == generation => {
                job.abort = Some(abort);
                true
            }
            _ => {
                abort.abort();
                false
            }
        }
    }

    pub fn progress(&mut self, generation: u64, stage: Stage) {
        if self.is_current(generation) {
            self.status = stage.status().to_string();
        }
    }

    /// Deliver the outcome of a comparison. Returns false when the result
    /// was stale and has been dropped.
    pub fn finish(&mut self, generation: u64, outcome: Result<ResultGrid, CompareError>) -> bool {
        if !self.is_current(generation) {
            log::debug!("dropping result of superseded comparison {}", generation);
            return false;
        }
        self.job = None;

        match outcome {
            Ok(grid) => {
                self.grid = grid;
                self.phase = Phase::Complete;
                self.status = COMPLETE_MESSAGE.to_string();
            }
            Err(e) if e.is_cancelled() => {
                self.refresh_phase_after_stop();
                self.status.clear();
            }
            Err(e) => {
                log::warn!("comparison {} failed: {}", generation, e);
                self.phase = Phase::Failed;
                self.status = e.status_message();
            }
        }
        true
    }

    /// Reset files, script, status and results; cancels a running compare
    pub fn clear(&mut self) {
        self.reset_form();
    }

    pub fn snapshot(&self) -> ShellSnapshot {
        let view = match self.view {
            View::Loading => "loading",
            View::Unauthenticated => "unauthenticated",
            View::Authenticated(_) => "authenticated",
        };
        ShellSnapshot {
            view,
            user: self.user().cloned(),
            phase: self.phase,
            file1: self.file_name(Slot::First).map(str::to_string),
            file2: self.file_name(Slot::Second).map(str::to_string),
            script: self.script.clone(),
            status: self.status.clone(),
            table: present(&self.grid),
            export_enabled: self.export_enabled(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.job.as_ref().is_some_and(|job| job.generation == generation)
    }

    fn stop_job(&mut self) {
        if let Some(job) = self.job.take() {
            log::info!("cancelling comparison {}", job.generation);
            job.stop();
        }
    }

    fn reset_form(&mut self) {
        self.stop_job();
        self.first = None;
        self.second = None;
        self.script = None;
        self.grid = ResultGrid::empty();
        self.status.clear();
        self.phase = Phase::Empty;
    }

    fn inputs_ready(&self) -> bool {
        self.first.is_some() && self.second.is_some() && self.script.is_some()
    }

    /// Re-derive the form phase from the inputs; a running job keeps `Processing`
    fn refresh_phase(&mut self) {
        if self.phase != Phase::Processing {
            self.phase = if self.inputs_ready() {
                Phase::Ready
            } else {
                Phase::Empty
            };
        }
    }

    fn refresh_phase_after_stop(&mut self) {
        self.phase = Phase::Empty;
        self.refresh_phase();
    }
}

/// Serializable view of the shell, polled by the page
#[derive(Debug, Clone, Serialize)]
pub struct ShellSnapshot {
    pub view: &'static str,
    pub user: Option<User>,
    pub phase: Phase,
    pub file1: Option<String>,
    pub file2: Option<String>,
    pub script: Option<String>,
    pub status: String,
    pub table: Option<TableView>,
    pub export_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecError, FetchError};
    use crate::grid::Cell;

    fn user(uid: &str) -> User {
        User {
            uid: uid.to_string(),
            email: format!("{uid}@example.com"),
            display_name: None,
            email_verified: false,
        }
    }

    fn signed_in() -> SessionShell {
        let mut shell = SessionShell::new();
        shell.identity_changed(Some(user("u1")));
        shell
    }

    fn ready() -> SessionShell {
        let mut shell = signed_in();
        shell.select_file(Slot::First, UploadedFile::new("a.csv", "x"));
        shell.select_file(Slot::Second, UploadedFile::new("b.csv", "y"));
        shell.select_script("run5");
        shell
    }

    fn grid() -> ResultGrid {
        ResultGrid::new(vec![vec![Cell::text("A")], vec![Cell::Number(1.0)]])
    }

    #[test]
    fn loading_is_left_on_first_callback() {
        let mut shell = SessionShell::new();
        assert_eq!(shell.view(), &View::Loading);
        shell.identity_changed(None);
        assert_eq!(shell.view(), &View::Unauthenticated);
        shell.identity_changed(Some(user("u1")));
        assert_eq!(shell.user().map(|u| u.uid.as_str()), Some("u1"));
    }

    #[test]
    fn missing_inputs_only_set_status() {
        let mut shell = signed_in();
        shell.select_file(Slot::First, UploadedFile::new("a.csv", "x"));

        for _ in 0..2 {
            assert!(shell.begin_compare().is_none());
            assert_eq!(shell.status(), MISSING_INPUTS_MESSAGE);
            assert_eq!(shell.phase(), Phase::Empty);
            assert_eq!(shell.file_name(Slot::First), Some("a.csv"));
            assert!(shell.grid().is_empty());
        }
    }

    #[test]
    fn phases_follow_a_successful_run() {
        let mut shell = ready();
        assert_eq!(shell.phase(), Phase::Ready);

        let started = shell.begin_compare().unwrap();
        assert_eq!(shell.phase(), Phase::Processing);
        assert_eq!(shell.status(), "Processing files...");

        shell.progress(started.generation, Stage::Comparing);
        assert_eq!(shell.status(), "Comparing files...");

        assert!(shell.finish(started.generation, Ok(grid())));
        assert_eq!(shell.phase(), Phase::Complete);
        assert_eq!(shell.status(), "Comparison complete!");
        assert!(shell.export_enabled());
    }

    #[test]
    fn failure_keeps_previous_grid() {
        let mut shell = ready();
        let first = shell.begin_compare().unwrap();
        shell.finish(first.generation, Ok(grid()));

        let second = shell.begin_compare().unwrap();
        shell.finish(second.generation, Err(FetchError::Status(404).into()));

        assert_eq!(shell.phase(), Phase::Failed);
        assert_eq!(shell.status(), "Failed to fetch comparison script");
        assert_eq!(shell.grid(), &grid());
    }

    #[test]
    fn new_inputs_after_a_run_return_to_ready() {
        let mut shell = ready();
        let started = shell.begin_compare().unwrap();
        shell.finish(started.generation, Ok(grid()));

        shell.select_file(Slot::Second, UploadedFile::new("c.csv", "z"));
        assert_eq!(shell.phase(), Phase::Ready);
        assert_eq!(shell.grid(), &grid());

        let failed = shell.begin_compare().unwrap();
        shell.finish(failed.generation, Err(FetchError::Status(404).into()));
        assert_eq!(shell.phase(), Phase::Failed);

        shell.select_script("cell-diff");
        assert_eq!(shell.phase(), Phase::Ready);
        shell.select_script("");
        assert_eq!(shell.phase(), Phase::Empty);
    }

    #[test]
    fn clear_discards_late_result() {
        let mut shell = ready();
        let started = shell.begin_compare().unwrap();
        shell.clear();

        assert!(started.cancel.is_cancelled());
        assert!(!shell.finish(started.generation, Ok(grid())));
        assert!(shell.grid().is_empty());
        assert_eq!(shell.phase(), Phase::Empty);
        assert_eq!(shell.status(), "");
        assert!(shell.script().is_none());
    }

    #[test]
    fn sign_out_cancels_and_discards() {
        let mut shell = ready();
        let started = shell.begin_compare().unwrap();
        shell.identity_changed(None);

        assert_eq!(shell.view(), &View::Unauthenticated);
        assert!(started.cancel.is_cancelled());
        assert!(!shell.finish(started.generation, Ok(grid())));
        assert!(shell.begin_compare().is_none());
    }

    #[test]
    fn newer_compare_supersedes_older() {
        let mut shell = ready();
        let old = shell.begin_compare().unwrap();
        let new = shell.begin_compare().unwrap();

        assert!(old.cancel.is_cancelled());
        assert!(!new.cancel.is_cancelled());
        assert!(!shell.finish(old.generation, Err(ExecError::Cancelled.into())));
        assert_eq!(shell.phase(), Phase::Processing);
        assert!(shell.finish(new.generation, Ok(grid())));
    }

    #[test]
    fn token_refresh_keeps_form() {
        let mut shell = ready();
        shell.identity_changed(Some(user("u1")));
        assert_eq!(shell.phase(), Phase::Ready);

        shell.identity_changed(Some(user("u2")));
        assert_eq!(shell.phase(), Phase::Empty);
        assert!(shell.file_name(Slot::First).is_none());
    }

    #[test]
    fn snapshot_carries_table() {
        let mut shell = ready();
        let started = shell.begin_compare().unwrap();
        shell.finish(started.generation, Ok(grid()));

        let json = serde_json::to_value(shell.snapshot()).unwrap();
        assert_eq!(json["view"], "authenticated");
        assert_eq!(json["phase"], "complete");
        assert_eq!(json["file1"], "a.csv");
        assert_eq!(json["table"]["headers"][0], "A");
        assert_eq!(json["table"]["rows"][0][0]["highlight"], "non-negative");
        assert_eq!(json["export_enabled"], true);
    }

    #[tokio::test]
    async fn stale_task_handle_is_aborted() {
        let mut shell = ready();
        let old = shell.begin_compare().unwrap();
        let _new = shell.begin_compare().unwrap();

        let task = tokio::spawn(std::future::pending::<()>());
        assert!(!shell.attach_task(old.generation, task.abort_handle()));
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
