//! Submitted-application bookkeeping (spec.md §4.6's `_submit_app`/
//! `_act_on_app`). An `AppRecord` tracks one client-submitted job through
//! the status progression the original calls `NEW -> ASSIGNED -> RUN ->
//! <terminal>`, where terminal is one of `KILLED`, `SUCCEEDED`, `FAILED`.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppStatus {
    New,
    Assigned,
    Run,
    Killed,
    Succeeded,
    Failed(String),
}

impl AppStatus {
    /// Active statuses are the ones `kill` can still act on and the ones
    /// a synchronous submitter keeps polling past (spec.md §4.6, "active
    /// status" set in `_serve_synch_app`).
    pub fn is_active(&self) -> bool {
        matches!(self, AppStatus::New | AppStatus::Assigned | AppStatus::Run)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AppStatus::New => "new",
            AppStatus::Assigned => "assigned",
            AppStatus::Run => "run",
            AppStatus::Killed => "killed",
            AppStatus::Succeeded => "succeeded",
            AppStatus::Failed(_) => "failed",
        }
    }
}

pub struct AppRecord {
    pub id: u64,
    /// The DN/user-name pair identified at connection time
    /// (SPEC_FULL.md §4.6, "`_submit_app` unbound `user`" resolution).
    pub owner_dn: String,
    pub owner_user: String,
    pub title: String,
    pub args: Vec<String>,
    pub write_request: bool,
    pub status: RefCell<AppStatus>,
    pub exit_code: Cell<Option<i32>>,
    pub pid: Cell<Option<u32>>,
    pub work_area: PathBuf,
}

impl AppRecord {
    pub fn new(
        id: u64,
        owner_dn: String,
        owner_user: String,
        title: String,
        args: Vec<String>,
        write_request: bool,
        work_area: PathBuf,
    ) -> Self {
        AppRecord {
            id,
            owner_dn,
            owner_user,
            title,
            args,
            write_request,
            status: RefCell::new(AppStatus::New),
            exit_code: Cell::new(None),
            pid: Cell::new(None),
            work_area,
        }
    }

    pub fn status(&self) -> AppStatus {
        self.status.borrow().clone()
    }

    pub fn set_status(&self, status: AppStatus) {
        *self.status.borrow_mut() = status;
    }

    /// The JSON shape `poll` hands back as a response `message` (spec.md
    /// §4.6's "application record with its human-readable status").
    pub fn to_json(&self) -> Value {
        json!({
            "appid": self.id,
            "title": self.title,
            "args": self.args,
            "user": self.owner_user,
            "status": self.status().name(),
            "exit_code": self.exit_code.get(),
        })
    }
}

impl Serialize for AppStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_in_new_status() {
        let record = AppRecord::new(1, "CN=alice".into(), "alice".into(), "sync".into(), vec![], false, PathBuf::from("/tmp/x"));
        assert_eq!(record.status(), AppStatus::New);
        assert!(record.status().is_active());
    }

    #[test]
    fn terminal_statuses_are_not_active() {
        assert!(!AppStatus::Killed.is_active());
        assert!(!AppStatus::Succeeded.is_active());
        assert!(!AppStatus::Failed("boom".into()).is_active());
    }

    #[test]
    fn to_json_reflects_current_status_and_exit_code() {
        let record = AppRecord::new(7, "CN=alice".into(), "alice".into(), "resync".into(), vec!["/a".into()], true, PathBuf::from("/tmp/x"));
        record.set_status(AppStatus::Succeeded);
        record.exit_code.set(Some(0));
        let json = record.to_json();
        assert_eq!(json["appid"], 7);
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["exit_code"], 0);
    }
}
