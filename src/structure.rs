use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow};

use crate::codec::{self, CodecError};

/// A stored child tagged with the key the store assigned to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: String,
    #[serde(flatten)]
    pub data: T,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Admin,
    Mentor,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Student => "Student",
            Role::Admin => "Admin",
            Role::Mentor => "Mentor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Student" => Ok(Role::Student),
            "Admin" => Ok(Role::Admin),
            "Mentor" => Ok(Role::Mentor),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Moderation state shared by files and mentor applications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    #[serde(rename = "PDF")]
    Pdf,
    #[serde(rename = "DOC")]
    Doc,
    #[serde(rename = "PPT")]
    Ppt,
    #[serde(rename = "ZIP")]
    Zip,
    #[serde(rename = "IMG")]
    Img,
    #[serde(other)]
    Other,
}

impl FileType {
    pub const fn extension(self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Doc => "docx",
            FileType::Ppt => "pptx",
            FileType::Zip => "zip",
            FileType::Img => "png",
            FileType::Other => "txt",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyFile {
    pub title: String,
    pub subject: String,
    #[serde(default)]
    pub semester: String,
    pub uploader: String,
    #[serde(default)]
    pub uploader_id: String,
    #[serde(default)]
    pub file_type: FileType,
    #[serde(default)]
    pub file_size: String,
    #[serde(default)]
    pub file_size_bytes: u64,
    pub upload_date: String,
    #[serde(default)]
    pub download_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_blob_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_chunks: Option<Vec<String>>,
}

impl StudyFile {
    /// The stored data URL, preferring chunks over the single-string form.
    pub fn payload(&self) -> Result<String, CodecError> {
        match (&self.file_chunks, &self.file_blob_data) {
            (Some(chunks), _) if !chunks.is_empty() => Ok(codec::reassemble(chunks)),
            (_, Some(blob)) if !blob.is_empty() => Ok(blob.clone()),
            _ => Err(CodecError::ContentUnavailable),
        }
    }

    /// Approved files are public; pending and rejected ones are seen only by
    /// their uploader and by admins.
    pub fn visible_to(&self, roll_number: &str, is_admin: bool) -> bool {
        is_admin || self.status == ReviewStatus::Approved || self.uploader == roll_number
    }

    /// Metadata only, for listings.
    pub fn without_payload(&self) -> Self {
        Self {
            file_blob_data: None,
            file_chunks: None,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads: Option<u64>,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoubtStatus {
    Pending,
    Answered,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubtRequest {
    pub student_name: String,
    pub subject: String,
    pub question: String,
    pub status: DoubtStatus,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentorRequest {
    pub roll_number: String,
    pub expertise: String,
    pub year: String,
    pub status: ReviewStatus,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LostCategory {
    Electronics,
    Books,
    #[serde(rename = "ID Card")]
    IdCard,
    Keys,
    Clothing,
    #[default]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LostStatus {
    Lost,
    Found,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LostItem {
    pub item_name: String,
    pub description: String,
    pub category: LostCategory,
    pub location: String,
    pub date_reported: String,
    pub reported_by: String,
    pub status: LostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub timestamp: String,
}

pub const SETTINGS_VERSION: u32 = 1;

const fn current_settings_version() -> u32 {
    SETTINGS_VERSION
}

const fn manual_review_default() -> bool {
    true
}

/// The global settings singleton. Missing fields read as their defaults,
/// so settings written before `version` existed still load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "current_settings_version")]
    pub version: u32,
    #[serde(default = "manual_review_default")]
    pub manual_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_news: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            manual_review: true,
            latest_news: None,
        }
    }
}

/// Partial settings update; only the fields that are set get merged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_review: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_news: Option<String>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.manual_review.is_none() && self.latest_news.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub roll_number: String,
    pub role: Role,
    pub created_at: String,
    pub last_login: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyllabusItem {
    pub subject: String,
    pub module_name: String,
    pub completed: bool,
    pub priority: Priority,
}

/// One row of the Postgres node table.
#[derive(Clone, FromRow, Debug)]
pub struct StoredNode {
    pub seq: i64,
    pub path: String,
    pub key: String,
    pub value: Json<Value>,
}
