//! Domain mutation handlers.
//!
//! Every handler has the same shape: check role and ownership, build the
//! record, write it through the sync layer, then append an audit entry. The
//! audit append is best effort; a failed log never undoes or fails the
//! primary write.

use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    codec::{self, Blob, UploadDraft},
    error::AppError,
    session::Session,
    structure::{
        ActivityLog, DoubtRequest, DoubtStatus, LostCategory, LostItem, LostStatus, MentorRequest, Priority,
        Record, ReviewStatus, Role, Settings, SettingsPatch, StudyFile, Subject, SyllabusItem, User,
    },
    sync::{StorePath, SyncLayer},
};

/// Phrase an operator must type to wipe the store.
pub const RESET_PHRASE: &str = "ERASE ALL RECORDS";

const WEEK_IN_DAYS: i64 = 7;

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn required(field: &str, value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::ValidationFailed(format!("{field} is required")));
    }
    Ok(value.to_string())
}

/// Proof that the caller went through an explicit confirmation step before a
/// full reset. Only the exact [`RESET_PHRASE`] produces one.
#[derive(Debug)]
pub struct ResetConfirmation(());

impl ResetConfirmation {
    pub fn from_phrase(phrase: &str) -> Option<Self> {
        (phrase == RESET_PHRASE).then_some(Self(()))
    }
}

/// An upload ready to be submitted, with the form fields that accompany it.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub title: String,
    pub subject: String,
    pub semester: String,
    pub description: Option<String>,
    pub draft: UploadDraft,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLostItem {
    pub item_name: String,
    pub description: String,
    #[serde(default)]
    pub category: LostCategory,
    pub location: String,
    #[serde(default)]
    pub contact_info: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// A decoded file ready to hand to the client.
#[derive(Debug)]
pub struct Download {
    pub file_name: String,
    pub blob: Blob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub total_files: usize,
    pub downloads: u64,
    pub weekly_uploads: usize,
}

fn default_syllabus() -> Vec<SyllabusItem> {
    [
        ("CS101", "Introduction to Algorithms", true, Priority::High),
        ("CS101", "Complexity Analysis", false, Priority::High),
        ("MATH202", "Linear Algebra", false, Priority::Medium),
        ("OS301", "Memory Management", false, Priority::High),
    ]
    .into_iter()
    .map(|(subject, module_name, completed, priority)| SyllabusItem {
        subject: subject.to_string(),
        module_name: module_name.to_string(),
        completed,
        priority,
    })
    .collect()
}

#[derive(Clone)]
pub struct Campus {
    sync: SyncLayer,
}

impl Campus {
    pub fn new(sync: SyncLayer) -> Self {
        Self { sync }
    }

    pub fn sync(&self) -> &SyncLayer {
        &self.sync
    }

    async fn record_activity(&self, action: impl Into<String>, details: impl Into<String>, downloads: Option<u64>) {
        let entry = ActivityLog {
            action: action.into(),
            details: Some(details.into()),
            downloads,
            timestamp: now(),
        };

        if let Err(e) = self.sync.push(StorePath::Logs, &entry).await {
            warn!(action = %entry.action, error = %e, "activity log append failed");
        }
    }

    async fn file(&self, id: &str) -> Result<Record<StudyFile>, AppError> {
        self.sync
            .get::<StudyFile>(StorePath::Files, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("file '{id}'")))
    }

    async fn mentor_request(&self, id: &str) -> Result<Record<MentorRequest>, AppError> {
        self.sync
            .get::<MentorRequest>(StorePath::MentorRequests, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("mentor request '{id}'")))
    }

    async fn lost_item(&self, id: &str) -> Result<Record<LostItem>, AppError> {
        self.sync
            .get::<LostItem>(StorePath::LostItems, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("lost item '{id}'")))
    }

    async fn user(&self, roll_number: &str) -> Result<Option<User>, AppError> {
        Ok(self
            .sync
            .get::<User>(StorePath::Users, roll_number)
            .await?
            .map(|record| record.data))
    }

    // --- Sessions ---

    /// Start a session: create the user on first login, refresh
    /// `lastLogin` otherwise. A role stored for the user wins over the one
    /// the identifier implies.
    pub async fn login(&self, roll_number: &str) -> Result<Session, AppError> {
        let session = Session::new(roll_number)?;
        let timestamp = now();

        let session = match self.user(session.roll_number()).await? {
            Some(user) => {
                self.sync
                    .update(StorePath::Users, session.roll_number(), &json!({ "lastLogin": timestamp }))
                    .await?;
                session.with_role(user.role)
            }
            None => {
                let user = User {
                    roll_number: session.roll_number().to_string(),
                    role: session.role(),
                    created_at: timestamp.clone(),
                    last_login: timestamp,
                };
                self.sync
                    .set_child(StorePath::Users, session.roll_number(), &user)
                    .await?;
                session
            }
        };

        info!(roll_number = session.roll_number(), role = %session.role(), "session started");
        self.record_activity(
            format!("System Access: {}", session.roll_number()),
            format!("Role assigned: {}", session.role()),
            None,
        )
        .await;

        Ok(session)
    }

    /// Rebuild a session from the pair a client persisted.
    pub async fn resume(&self, identifier: Option<&str>, role: Option<&str>) -> Result<Option<Session>, AppError> {
        let Some(session) = Session::restore(identifier, role) else {
            return Ok(None);
        };

        Ok(Some(match self.user(session.roll_number()).await? {
            Some(user) => session.with_role(user.role),
            None => session,
        }))
    }

    pub async fn logout(&self, session: Session) {
        let roll_number = session.close().await;
        info!(roll_number = %roll_number, "session ended");
        self.record_activity(format!("Session Ended: {roll_number}"), "", None).await;
    }

    pub async fn promote_to_admin(&self, session: &Session, roll_number: &str) -> Result<(), AppError> {
        session.require_admin("grant admin control")?;
        if self.user(roll_number).await?.is_none() {
            return Err(AppError::NotFound(format!("user '{roll_number}'")));
        }

        self.sync
            .update(StorePath::Users, roll_number, &json!({ "role": Role::Admin }))
            .await?;

        self.record_activity(
            "Privilege Escalation",
            format!("User {roll_number} granted Admin control"),
            None,
        )
        .await;
        Ok(())
    }

    // --- Files ---

    pub async fn settings(&self) -> Result<Settings, AppError> {
        Ok(self.sync.value::<Settings>(StorePath::Settings).await?.unwrap_or_default())
    }

    pub async fn add_file(&self, session: &Session, file: NewFile) -> Result<Record<StudyFile>, AppError> {
        codec::check_size(file.draft.file_size_bytes)?;
        let title = required("title", &file.title)?;
        let subject = required("subject", &file.subject)?;
        if file.draft.file_chunks.is_empty() {
            return Err(AppError::ValidationFailed("file content is required".to_string()));
        }

        let manual_review = self.settings().await?.manual_review;
        let record = StudyFile {
            title,
            subject,
            semester: file.semester.trim().to_string(),
            uploader: session.roll_number().to_string(),
            uploader_id: session.roll_number().to_string(),
            file_type: file.draft.file_type,
            file_size: file.draft.file_size,
            file_size_bytes: file.draft.file_size_bytes,
            upload_date: today(),
            download_count: 0,
            description: file.description.filter(|d| !d.trim().is_empty()),
            status: if manual_review {
                ReviewStatus::Pending
            } else {
                ReviewStatus::Approved
            },
            file_blob_data: None,
            file_chunks: Some(file.draft.file_chunks),
        };

        let id = self.sync.push(StorePath::Files, &record).await?;

        info!(id = %id, title = %record.title, status = ?record.status, "file submitted");
        self.record_activity(
            "Incoming Upload",
            format!("{} submitted \"{}\"", session.roll_number(), record.title),
            Some(0),
        )
        .await;

        Ok(Record { id, data: record })
    }

    async fn review_file(&self, session: &Session, id: &str, status: ReviewStatus) -> Result<(), AppError> {
        session.require_admin("review files")?;
        let file = self.file(id).await?;

        self.sync.update(StorePath::Files, id, &json!({ "status": status })).await?;

        let (action, verb) = match status {
            ReviewStatus::Approved => ("Resource Approved", "verified"),
            ReviewStatus::Rejected => ("Resource Rejected", "declined"),
            ReviewStatus::Pending => ("Resource Requeued", "requeued"),
        };
        self.record_activity(
            action,
            format!("Admin {verb} \"{}\"", file.data.title),
            Some(file.data.download_count),
        )
        .await;
        Ok(())
    }

    pub async fn approve_file(&self, session: &Session, id: &str) -> Result<(), AppError> {
        self.review_file(session, id, ReviewStatus::Approved).await
    }

    pub async fn reject_file(&self, session: &Session, id: &str) -> Result<(), AppError> {
        self.review_file(session, id, ReviewStatus::Rejected).await
    }

    /// Admins may delete any file; everyone else only their own uploads.
    pub async fn delete_file(&self, session: &Session, id: &str) -> Result<(), AppError> {
        let file = self.file(id).await?;
        if !session.is_admin() && file.data.uploader != session.roll_number() {
            return Err(AppError::Unauthorized(
                "Only admins or the uploader can delete files".to_string(),
            ));
        }

        self.sync.remove(StorePath::Files, id).await?;

        self.record_activity(
            "Resource Purged",
            format!("Asset \"{}\" removed permanently", file.data.title),
            Some(file.data.download_count),
        )
        .await;
        Ok(())
    }

    /// Count the download, log it, then resolve and decode the payload. The
    /// count is taken on the attempt, so a corrupt payload still counts.
    pub async fn download_file(&self, session: &Session, id: &str) -> Result<Download, AppError> {
        let file = self.file(id).await?;
        if !file.data.visible_to(session.roll_number(), session.is_admin()) {
            return Err(AppError::Unauthorized("This resource is awaiting review".to_string()));
        }

        let count = file.data.download_count + 1;
        self.sync
            .update(StorePath::Files, id, &json!({ "downloadCount": count }))
            .await?;
        self.record_activity(
            "Resource Accessed",
            format!("User {} downloaded \"{}\"", session.roll_number(), file.data.title),
            Some(count),
        )
        .await;

        let blob = codec::decode(&file.data.payload()?)?;

        Ok(Download {
            file_name: codec::download_name(&file.data.title, file.data.file_type),
            blob,
        })
    }

    /// Files this session may browse: approved ones, its own uploads, or
    /// everything for admins. Payloads are stripped.
    pub async fn visible_files(&self, session: &Session) -> Result<Vec<Record<StudyFile>>, AppError> {
        let files = self.sync.list::<StudyFile>(StorePath::Files).await?;

        Ok(files
            .into_iter()
            .filter(|f| f.data.visible_to(session.roll_number(), session.is_admin()))
            .map(|f| Record {
                data: f.data.without_payload(),
                id: f.id,
            })
            .collect())
    }

    pub async fn repository_stats(&self) -> Result<RepositoryStats, AppError> {
        let files = self.sync.list::<StudyFile>(StorePath::Files).await?;
        let today = Utc::now().date_naive();

        let approved = files.iter().filter(|f| f.data.status == ReviewStatus::Approved);
        let weekly_uploads = files
            .iter()
            .filter_map(|f| NaiveDate::parse_from_str(&f.data.upload_date, "%Y-%m-%d").ok())
            .filter(|date| (today - *date).num_days() < WEEK_IN_DAYS)
            .count();

        Ok(RepositoryStats {
            total_files: approved.clone().count(),
            downloads: approved.map(|f| f.data.download_count).sum(),
            weekly_uploads,
        })
    }

    // --- Subjects ---

    pub async fn subjects(&self) -> Result<Vec<Record<Subject>>, AppError> {
        Ok(self.sync.list(StorePath::Subjects).await?)
    }

    pub async fn add_subject(&self, session: &Session, name: &str) -> Result<Record<Subject>, AppError> {
        session.require_admin("add subjects")?;
        let subject = Subject {
            name: required("subject name", name)?,
        };

        let id = self.sync.push(StorePath::Subjects, &subject).await?;
        self.record_activity("Subject Created", format!("Admin added \"{}\"", subject.name), None)
            .await;

        Ok(Record { id, data: subject })
    }

    pub async fn delete_subject(&self, session: &Session, id: &str) -> Result<(), AppError> {
        session.require_admin("delete subjects")?;

        self.sync.remove(StorePath::Subjects, id).await?;
        self.record_activity("Subject Deleted", "Admin removed subject", None).await;
        Ok(())
    }

    // --- Doubts and mentors ---

    pub async fn doubts(&self) -> Result<Vec<Record<DoubtRequest>>, AppError> {
        Ok(self.sync.list(StorePath::Doubts).await?)
    }

    pub async fn add_doubt(&self, session: &Session, subject: &str, question: &str) -> Result<Record<DoubtRequest>, AppError> {
        let doubt = DoubtRequest {
            student_name: session.roll_number().to_string(),
            subject: required("subject", subject)?,
            question: required("question", question)?,
            status: DoubtStatus::Pending,
            timestamp: now(),
        };

        let id = self.sync.push(StorePath::Doubts, &doubt).await?;
        self.record_activity(
            "Doubt Created",
            format!("{} in {}", session.roll_number(), doubt.subject),
            None,
        )
        .await;

        Ok(Record { id, data: doubt })
    }

    async fn is_approved_mentor(&self, roll_number: &str) -> Result<bool, AppError> {
        let requests = self.sync.list::<MentorRequest>(StorePath::MentorRequests).await?;
        Ok(requests
            .iter()
            .any(|r| r.data.roll_number == roll_number && r.data.status == ReviewStatus::Approved))
    }

    /// Admins and approved mentors may close out a doubt.
    pub async fn answer_doubt(&self, session: &Session, id: &str) -> Result<(), AppError> {
        if !session.is_admin()
            && session.role() != Role::Mentor
            && !self.is_approved_mentor(session.roll_number()).await?
        {
            return Err(AppError::Unauthorized(
                "Only admins or approved mentors can answer doubts".to_string(),
            ));
        }
        let doubt = self
            .sync
            .get::<DoubtRequest>(StorePath::Doubts, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("doubt '{id}'")))?;

        self.sync
            .update(StorePath::Doubts, id, &json!({ "status": DoubtStatus::Answered }))
            .await?;
        self.record_activity(
            "Doubt Answered",
            format!("{} answered a {} doubt", session.roll_number(), doubt.data.subject),
            None,
        )
        .await;
        Ok(())
    }

    pub async fn mentor_requests(&self) -> Result<Vec<Record<MentorRequest>>, AppError> {
        Ok(self.sync.list(StorePath::MentorRequests).await?)
    }

    pub async fn submit_mentor_request(
        &self,
        session: &Session,
        expertise: &str,
        year: &str,
    ) -> Result<Record<MentorRequest>, AppError> {
        let request = MentorRequest {
            roll_number: session.roll_number().to_string(),
            expertise: required("expertise", expertise)?,
            year: required("year", year)?,
            status: ReviewStatus::Pending,
            timestamp: now(),
        };

        let id = self.sync.push(StorePath::MentorRequests, &request).await?;
        self.record_activity(
            "Mentor Application",
            format!("User {} applied for {}", request.roll_number, request.expertise),
            None,
        )
        .await;

        Ok(Record { id, data: request })
    }

    pub async fn approve_mentor(&self, session: &Session, id: &str) -> Result<(), AppError> {
        session.require_admin("approve mentors")?;
        let request = self.mentor_request(id).await?;

        self.sync
            .update(StorePath::MentorRequests, id, &json!({ "status": ReviewStatus::Approved }))
            .await?;
        self.record_activity(
            "Mentor Approved",
            format!("User {} is now an Official Mentor", request.data.roll_number),
            None,
        )
        .await;
        Ok(())
    }

    pub async fn reject_mentor(&self, session: &Session, id: &str) -> Result<(), AppError> {
        session.require_admin("reject mentors")?;
        let request = self.mentor_request(id).await?;

        self.sync
            .update(StorePath::MentorRequests, id, &json!({ "status": ReviewStatus::Rejected }))
            .await?;
        self.record_activity(
            "Mentor Rejected",
            format!("User {} application declined", request.data.roll_number),
            None,
        )
        .await;
        Ok(())
    }

    // --- Lost and found ---

    pub async fn lost_items(&self) -> Result<Vec<Record<LostItem>>, AppError> {
        Ok(self.sync.list(StorePath::LostItems).await?)
    }

    pub async fn report_lost_item(&self, session: &Session, item: NewLostItem) -> Result<Record<LostItem>, AppError> {
        let item = LostItem {
            item_name: required("item name", &item.item_name)?,
            description: item.description.trim().to_string(),
            category: item.category,
            location: required("location", &item.location)?,
            date_reported: today(),
            reported_by: session.roll_number().to_string(),
            status: LostStatus::Lost,
            contact_info: item.contact_info.filter(|c| !c.trim().is_empty()),
            image_url: item.image_url.filter(|u| !u.trim().is_empty()),
            timestamp: now(),
        };

        let id = self.sync.push(StorePath::LostItems, &item).await?;
        self.record_activity(
            "Lost Item Report",
            format!("{} reported: {}", session.roll_number(), item.item_name),
            None,
        )
        .await;

        Ok(Record { id, data: item })
    }

    /// Marking an item found removes it outright; there is no archive.
    pub async fn update_lost_item_status(&self, session: &Session, id: &str, status: LostStatus) -> Result<(), AppError> {
        let item = self.lost_item(id).await?;
        if !session.is_admin() && item.data.reported_by != session.roll_number() {
            return Err(AppError::Unauthorized(
                "Only admins or the reporter can update this item".to_string(),
            ));
        }

        match status {
            LostStatus::Found => {
                self.sync.remove(StorePath::LostItems, id).await?;
                self.record_activity(
                    "Lost Item Resolved",
                    format!("{} was found and removed from system", item.data.item_name),
                    None,
                )
                .await;
            }
            LostStatus::Lost => {
                self.sync
                    .update(StorePath::LostItems, id, &json!({ "status": LostStatus::Lost }))
                    .await?;
                self.record_activity(
                    "Lost Item Update",
                    format!("{} marked as Lost", item.data.item_name),
                    None,
                )
                .await;
            }
        }
        Ok(())
    }

    pub async fn delete_lost_item(&self, session: &Session, id: &str) -> Result<(), AppError> {
        session.require_admin("delete lost items")?;
        let item = self.lost_item(id).await?;

        self.sync.remove(StorePath::LostItems, id).await?;
        self.record_activity(
            "Lost Item Deleted",
            format!("Admin removed \"{}\"", item.data.item_name),
            None,
        )
        .await;
        Ok(())
    }

    // --- Settings and administration ---

    /// Flip manual review. The whole settings object is rewritten, keeping
    /// the current news.
    pub async fn toggle_manual_review(&self, session: &Session) -> Result<Settings, AppError> {
        session.require_admin("toggle manual review")?;
        let current = self.settings().await?;
        let settings = Settings {
            manual_review: !current.manual_review,
            ..current
        };

        self.sync.set(StorePath::Settings, &settings).await?;
        self.record_activity(
            "Mode Change",
            format!(
                "Manual Review set to {}",
                if settings.manual_review { "ON" } else { "OFF" }
            ),
            None,
        )
        .await;

        Ok(settings)
    }

    pub async fn update_settings(&self, session: &Session, patch: &SettingsPatch) -> Result<Settings, AppError> {
        session.require_admin("update settings")?;
        if patch.is_empty() {
            return Err(AppError::ValidationFailed("no settings to update".to_string()));
        }

        self.sync.update_value(StorePath::Settings, patch).await?;
        self.record_activity("Settings Update", "Admin updated system configuration", None)
            .await;

        self.settings().await
    }

    /// Wipe every record under the store root. The wipe itself is logged
    /// afterwards, so the log starts over with that one entry.
    pub async fn clear_database(&self, session: &Session, _confirmation: ResetConfirmation) -> Result<(), AppError> {
        session.require_admin("clear the database")?;

        self.sync.clear().await?;
        warn!(roll_number = session.roll_number(), root = self.sync.root(), "store cleared");
        self.record_activity("System Wipe", "All database records were cleared by admin", None)
            .await;
        Ok(())
    }

    pub async fn activity_logs(&self, session: &Session) -> Result<Vec<Record<ActivityLog>>, AppError> {
        session.require_admin("view logs")?;
        Ok(self.sync.list(StorePath::Logs).await?)
    }

    // --- Syllabus tracker ---

    pub async fn syllabus(&self) -> Result<Vec<Record<SyllabusItem>>, AppError> {
        Ok(self.sync.list(StorePath::Syllabus).await?)
    }

    /// Fill an empty tracker with the default syllabus.
    pub async fn seed_syllabus(&self) -> Result<usize, AppError> {
        if !self.syllabus().await?.is_empty() {
            return Ok(0);
        }

        let items = default_syllabus();
        for item in &items {
            self.sync.push(StorePath::Syllabus, item).await?;
        }
        info!(count = items.len(), "syllabus seeded");
        Ok(items.len())
    }

    pub async fn toggle_syllabus_item(&self, _session: &Session, id: &str) -> Result<SyllabusItem, AppError> {
        let item = self
            .sync
            .get::<SyllabusItem>(StorePath::Syllabus, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("syllabus item '{id}'")))?;

        let completed = !item.data.completed;
        self.sync
            .update(StorePath::Syllabus, id, &json!({ "completed": completed }))
            .await?;

        Ok(SyllabusItem { completed, ..item.data })
    }
}
