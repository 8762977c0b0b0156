use std::io;

use actix_multipart::Multipart;
use actix_web::{
    dev::Payload,
    web::{self, delete, get, post, put, Bytes, Data, Json, Path},
    FromRequest, HttpRequest, HttpResponse,
};
use futures::{future::LocalBoxFuture, stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    codec::{self, Blob, UploadDraft},
    error::AppError,
    handlers::{Campus, Download, NewFile, NewLostItem, ResetConfirmation},
    insight::ExamInsights,
    session::Session,
    structure::{LostStatus, Record, Role, Settings, SettingsPatch, StudyFile},
    sync::{StorePath, Subscription},
};

pub const ROLL_HEADER: &str = "X-Roll-Number";
pub const ROLE_HEADER: &str = "X-User-Role";

/// Largest accepted value for a text field of the upload form, in bytes.
pub const TEXT_FIELD_LIMIT: u64 = 4 * 1024;

type HandlerResult = Result<HttpResponse, AppError>;

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl FromRequest for Session {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let campus = req.app_data::<Data<Campus>>().cloned();
        let roll_number = header(req, ROLL_HEADER);
        let role = header(req, ROLE_HEADER);

        Box::pin(async move {
            let campus = campus.ok_or_else(|| AppError::Transient("campus state is not configured".to_string()))?;

            campus
                .resume(roll_number.as_deref(), role.as_deref())
                .await?
                .ok_or(AppError::Unauthenticated)
        })
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/auth/login", post().to(handle_login))
        .route("/api/auth/logout", post().to(handle_logout))
        .route("/api/auth/promote", post().to(handle_promote))
        .route("/api/files", get().to(list_files))
        .route("/api/files/upload", post().to(handle_upload))
        .route("/api/files/{file_id}", delete().to(handle_delete_file))
        .route("/api/files/{file_id}/approve", post().to(handle_approve_file))
        .route("/api/files/{file_id}/reject", post().to(handle_reject_file))
        .route("/api/files/{file_id}/download", get().to(handle_download))
        .route("/api/subjects", get().to(list_subjects))
        .route("/api/subjects", post().to(handle_add_subject))
        .route("/api/subjects/{subject_id}", delete().to(handle_delete_subject))
        .route("/api/doubts", get().to(list_doubts))
        .route("/api/doubts", post().to(handle_add_doubt))
        .route("/api/doubts/{doubt_id}/answer", post().to(handle_answer_doubt))
        .route("/api/mentors", get().to(list_mentor_requests))
        .route("/api/mentors", post().to(handle_mentor_request))
        .route("/api/mentors/{request_id}/approve", post().to(handle_approve_mentor))
        .route("/api/mentors/{request_id}/reject", post().to(handle_reject_mentor))
        .route("/api/lost-items", get().to(list_lost_items))
        .route("/api/lost-items", post().to(handle_report_lost_item))
        .route("/api/lost-items/{item_id}/status", post().to(handle_lost_item_status))
        .route("/api/lost-items/{item_id}", delete().to(handle_delete_lost_item))
        .route("/api/settings", get().to(get_settings))
        .route("/api/settings", put().to(handle_update_settings))
        .route("/api/settings/toggle-manual-review", post().to(handle_toggle_manual_review))
        .route("/api/admin/reset", post().to(handle_reset))
        .route("/api/logs", get().to(list_logs))
        .route("/api/syllabus", get().to(list_syllabus))
        .route("/api/syllabus/{item_id}/toggle", post().to(handle_toggle_syllabus))
        .route("/api/stats", get().to(get_stats))
        .route("/api/insights", post().to(handle_insights))
        .route("/api/live/{collection}", get().to(handle_live));
}

// --- Auth ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollNumberBody {
    pub roll_number: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo<'a> {
    roll_number: &'a str,
    role: Role,
}

async fn handle_login(campus: Data<Campus>, body: Json<RollNumberBody>) -> HandlerResult {
    let session = campus.login(&body.roll_number).await?;

    Ok(HttpResponse::Ok().json(SessionInfo {
        roll_number: session.roll_number(),
        role: session.role(),
    }))
}

async fn handle_logout(campus: Data<Campus>, session: Session) -> HandlerResult {
    campus.logout(session).await;
    Ok(HttpResponse::NoContent().finish())
}

async fn handle_promote(campus: Data<Campus>, session: Session, body: Json<RollNumberBody>) -> HandlerResult {
    campus.promote_to_admin(&session, body.roll_number.trim()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// --- Files ---

async fn list_files(campus: Data<Campus>, session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.visible_files(&session).await?))
}

/// Form fields of an upload, gathered in whatever order the client sent them.
#[derive(Default)]
struct UploadForm {
    title: String,
    subject: String,
    semester: String,
    description: Option<String>,
    file: Option<(String, String, Vec<u8>)>,
}

async fn read_field(
    field: &mut actix_multipart::Field,
    limit: u64,
    too_large: impl Fn(u64) -> AppError,
) -> Result<Vec<u8>, AppError> {
    let mut data = Vec::new();

    while let Some(chunk) = field.next().await {
        let bytes = chunk.map_err(|e| AppError::ValidationFailed(format!("upload interrupted: {e}")))?;
        data.extend_from_slice(&bytes);

        if data.len() as u64 > limit {
            return Err(too_large(data.len() as u64));
        }
    }

    Ok(data)
}

async fn read_text_field(field: &mut actix_multipart::Field, name: &str) -> Result<String, AppError> {
    let data = read_field(field, TEXT_FIELD_LIMIT, |_| {
        AppError::ValidationFailed(format!("form field '{name}' exceeds {TEXT_FIELD_LIMIT} bytes"))
    })
    .await?;

    String::from_utf8(data)
        .map_err(|_| AppError::ValidationFailed(format!("form field '{name}' is not valid UTF-8")))
}

/// Read the multipart body, refusing the file as soon as it grows past the
/// platform limit.
async fn process_multipart_data(mut payload: Multipart) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| AppError::ValidationFailed(format!("malformed upload: {e}")))?;

        let Some(content_disposition) = field.content_disposition().cloned() else {
            continue;
        };
        let Some(name) = content_disposition.get_name() else {
            continue;
        };

        if name == "file" {
            let file_name = content_disposition.get_filename().unwrap_or("unknown").to_string();
            let mime = field
                .content_type()
                .map(|mime| mime.essence_str().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let data = read_field(&mut field, codec::MAX_FILE_SIZE_BYTES, |size| {
                codec::CodecError::TooLarge { size }.into()
            })
            .await?;

            debug!(file_name = %file_name, size = data.len(), "upload received");
            form.file = Some((file_name, mime, data));
            continue;
        }

        let value = read_text_field(&mut field, name).await?;
        match name {
            "title" => form.title = value,
            "subject" => form.subject = value,
            "semester" => form.semester = value,
            "description" => form.description = Some(value),
            other => debug!(field = other, "ignoring unknown upload field"),
        }
    }

    Ok(form)
}

async fn handle_upload(campus: Data<Campus>, session: Session, payload: Multipart) -> HandlerResult {
    let form = process_multipart_data(payload).await?;
    let Some((file_name, mime, data)) = form.file else {
        return Err(AppError::ValidationFailed("No file found in the upload".to_string()));
    };

    let draft = UploadDraft::prepare(&file_name, &mime, &data)?;
    let record = campus
        .add_file(
            &session,
            NewFile {
                title: form.title,
                subject: form.subject,
                semester: form.semester,
                description: form.description,
                draft,
            },
        )
        .await?;

    Ok(HttpResponse::Created().json(Record {
        data: record.data.without_payload(),
        id: record.id,
    }))
}

async fn handle_approve_file(campus: Data<Campus>, session: Session, file_id: Path<String>) -> HandlerResult {
    campus.approve_file(&session, &file_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn handle_reject_file(campus: Data<Campus>, session: Session, file_id: Path<String>) -> HandlerResult {
    campus.reject_file(&session, &file_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn handle_delete_file(campus: Data<Campus>, session: Session, file_id: Path<String>) -> HandlerResult {
    campus.delete_file(&session, &file_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// Stream the decoded file in its fixed-size parts
async fn handle_download(campus: Data<Campus>, session: Session, file_id: Path<String>) -> HandlerResult {
    let Download {
        file_name,
        blob: Blob { mime, parts },
    } = campus.download_file(&session, &file_id).await?;

    let length: u64 = parts.iter().map(|part| part.len() as u64).sum();
    let body = stream::iter(parts.into_iter().map(Ok::<_, io::Error>));

    Ok(HttpResponse::Ok()
        .content_type(mime)
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{file_name}\""),
        ))
        .no_chunking(length)
        .streaming(body))
}

// --- Subjects ---

#[derive(Deserialize)]
pub struct SubjectBody {
    pub name: String,
}

async fn list_subjects(campus: Data<Campus>) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.subjects().await?))
}

async fn handle_add_subject(campus: Data<Campus>, session: Session, body: Json<SubjectBody>) -> HandlerResult {
    Ok(HttpResponse::Created().json(campus.add_subject(&session, &body.name).await?))
}

async fn handle_delete_subject(campus: Data<Campus>, session: Session, subject_id: Path<String>) -> HandlerResult {
    campus.delete_subject(&session, &subject_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// --- Doubts and mentors ---

#[derive(Deserialize)]
pub struct DoubtBody {
    pub subject: String,
    pub question: String,
}

#[derive(Deserialize)]
pub struct MentorBody {
    pub expertise: String,
    pub year: String,
}

async fn list_doubts(campus: Data<Campus>, _session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.doubts().await?))
}

async fn handle_add_doubt(campus: Data<Campus>, session: Session, body: Json<DoubtBody>) -> HandlerResult {
    let doubt = campus.add_doubt(&session, &body.subject, &body.question).await?;
    Ok(HttpResponse::Created().json(doubt))
}

async fn handle_answer_doubt(campus: Data<Campus>, session: Session, doubt_id: Path<String>) -> HandlerResult {
    campus.answer_doubt(&session, &doubt_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn list_mentor_requests(campus: Data<Campus>, _session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.mentor_requests().await?))
}

async fn handle_mentor_request(campus: Data<Campus>, session: Session, body: Json<MentorBody>) -> HandlerResult {
    let request = campus
        .submit_mentor_request(&session, &body.expertise, &body.year)
        .await?;
    Ok(HttpResponse::Created().json(request))
}

async fn handle_approve_mentor(campus: Data<Campus>, session: Session, request_id: Path<String>) -> HandlerResult {
    campus.approve_mentor(&session, &request_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn handle_reject_mentor(campus: Data<Campus>, session: Session, request_id: Path<String>) -> HandlerResult {
    campus.reject_mentor(&session, &request_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// --- Lost and found ---

#[derive(Deserialize)]
pub struct LostStatusBody {
    pub status: LostStatus,
}

async fn list_lost_items(campus: Data<Campus>, _session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.lost_items().await?))
}

async fn handle_report_lost_item(campus: Data<Campus>, session: Session, body: Json<NewLostItem>) -> HandlerResult {
    let item = campus.report_lost_item(&session, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(item))
}

async fn handle_lost_item_status(
    campus: Data<Campus>,
    session: Session,
    item_id: Path<String>,
    body: Json<LostStatusBody>,
) -> HandlerResult {
    campus
        .update_lost_item_status(&session, &item_id, body.status)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn handle_delete_lost_item(campus: Data<Campus>, session: Session, item_id: Path<String>) -> HandlerResult {
    campus.delete_lost_item(&session, &item_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// --- Settings and administration ---

#[derive(Deserialize)]
pub struct ResetBody {
    pub confirmation: String,
}

async fn get_settings(campus: Data<Campus>) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.settings().await?))
}

async fn handle_update_settings(campus: Data<Campus>, session: Session, patch: Json<SettingsPatch>) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.update_settings(&session, &patch).await?))
}

async fn handle_toggle_manual_review(campus: Data<Campus>, session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.toggle_manual_review(&session).await?))
}

async fn handle_reset(campus: Data<Campus>, session: Session, body: Json<ResetBody>) -> HandlerResult {
    let confirmation = ResetConfirmation::from_phrase(&body.confirmation)
        .ok_or_else(|| AppError::ValidationFailed("confirmation phrase does not match".to_string()))?;

    campus.clear_database(&session, confirmation).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn list_logs(campus: Data<Campus>, session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.activity_logs(&session).await?))
}

// --- Syllabus, stats, insights ---

#[derive(Deserialize)]
pub struct InsightBody {
    pub syllabus: String,
}

#[derive(Serialize)]
struct InsightAnswer {
    insights: String,
}

async fn list_syllabus(campus: Data<Campus>, _session: Session) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.syllabus().await?))
}

async fn handle_toggle_syllabus(campus: Data<Campus>, session: Session, item_id: Path<String>) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.toggle_syllabus_item(&session, &item_id).await?))
}

async fn get_stats(campus: Data<Campus>) -> HandlerResult {
    Ok(HttpResponse::Ok().json(campus.repository_stats().await?))
}

async fn handle_insights(insights: Data<ExamInsights>, _session: Session, body: Json<InsightBody>) -> HandlerResult {
    let syllabus = body.syllabus.trim();
    if syllabus.is_empty() {
        return Err(AppError::ValidationFailed("syllabus text is required".to_string()));
    }

    Ok(HttpResponse::Ok().json(InsightAnswer {
        insights: insights.summarize(syllabus).await,
    }))
}

// --- Live feed ---

/// Serialize each snapshot into `tx`. Only the latest snapshot is kept; a
/// client that reads slowly skips the ones it missed.
fn forward<T: Serialize + 'static>(tx: watch::Sender<Option<String>>) -> impl FnMut(T) + Send + 'static {
    move |snapshot: T| match serde_json::to_string(&snapshot) {
        Ok(json) => {
            tx.send_replace(Some(json));
        }
        Err(e) => warn!(error = %e, "live snapshot could not be serialized"),
    }
}

fn subscribe_for(
    campus: &Campus,
    session: &Session,
    path: StorePath,
    tx: watch::Sender<Option<String>>,
) -> Subscription {
    let sync = campus.sync();

    match path {
        StorePath::Files => {
            let roll_number = session.roll_number().to_string();
            let is_admin = session.is_admin();
            let mut send = forward::<Vec<Record<StudyFile>>>(tx);

            sync.subscribe_to_list::<StudyFile, _>(path, move |files| {
                send(files
                    .into_iter()
                    .filter(|f| f.data.visible_to(&roll_number, is_admin))
                    .map(|f| Record {
                        data: f.data.without_payload(),
                        id: f.id,
                    })
                    .collect())
            })
        }
        StorePath::Settings => {
            let mut send = forward::<Settings>(tx);
            sync.subscribe_to_value::<Settings, _>(path, move |settings| send(settings.unwrap_or_default()))
        }
        _ => sync.subscribe_to_list::<Value, _>(path, forward::<Vec<Record<Value>>>(tx)),
    }
}

/// Event stream over the snapshots in `rx`. It owns `subscription`, so the
/// listener is released when the stream is dropped, and it ends once the
/// listener stops.
fn live_events(
    rx: watch::Receiver<Option<String>>,
    subscription: Subscription,
) -> impl Stream<Item = Result<Bytes, io::Error>> {
    stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
        loop {
            rx.changed().await.ok()?;
            let latest = rx.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                let event = Bytes::from(format!("data: {snapshot}\n\n"));
                return Some((Ok(event), (rx, subscription)));
            }
        }
    })
}

/// Server-sent events carrying a fresh snapshot of one collection after each
/// change.
async fn handle_live(campus: Data<Campus>, session: Session, collection: Path<String>) -> HandlerResult {
    let path = StorePath::from_segment(&collection)
        .ok_or_else(|| AppError::NotFound(format!("collection '{collection}'")))?;
    if matches!(path, StorePath::Logs | StorePath::Users) {
        session.require_admin("watch this collection")?;
    }

    let (tx, rx) = watch::channel(None);
    let subscription = subscribe_for(&campus, &session, path, tx);

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(live_events(rx, subscription)))
}

#[cfg(test)]
mod tests {
    use actix_web::{
        http::{header::CONTENT_DISPOSITION, StatusCode},
        test, App,
    };
    use serde_json::json;

    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{config::Config, sync::SyncLayer};

    const BOUNDARY: &str = "studyboostersboundary";
    const WAIT: Duration = Duration::from_secs(2);

    fn campus() -> Campus {
        Campus::new(SyncLayer::memory("http"))
    }

    fn new_file(title: &str) -> NewFile {
        NewFile {
            title: title.to_string(),
            subject: "CS101".to_string(),
            semester: "3".to_string(),
            description: None,
            draft: UploadDraft::prepare("notes.pdf", "application/pdf", b"chunked notes").unwrap(),
        }
    }

    fn event_records(event: &Bytes) -> Vec<Value> {
        let text = std::str::from_utf8(event).unwrap();
        let json = text.strip_prefix("data: ").unwrap().trim_end();
        serde_json::from_str(json).unwrap()
    }

    fn multipart_body(fields: &[(&str, &str)], file: (&str, &str, &[u8])) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
            );
        }

        let (file_name, mime, data) = file;
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    #[actix_web::test]
    async fn requests_without_a_session_are_unauthenticated() {
        let app = test::init_service(App::new().app_data(Data::new(campus())).configure(routes)).await;

        let req = test::TestRequest::get().uri("/api/files").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/api/files")
            .insert_header((ROLL_HEADER, "21CS102"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn login_reports_the_derived_role() {
        let app = test::init_service(App::new().app_data(Data::new(campus())).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/auth/login")
            .set_json(json!({ "rollNumber": "admin_ops" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "rollNumber": "admin_ops", "role": "Admin" }));
    }

    #[actix_web::test]
    async fn upload_then_download_streams_the_original_bytes() {
        let campus = campus();
        let admin = campus.login("ADMIN01").await.unwrap();
        campus.toggle_manual_review(&admin).await.unwrap();

        let app = test::init_service(App::new().app_data(Data::new(campus.clone())).configure(routes)).await;

        let body = multipart_body(
            &[("title", "Paging Notes"), ("subject", "OS301"), ("semester", "5")],
            ("paging.txt", "text/plain", b"pages and frames"),
        );
        let req = test::TestRequest::post()
            .uri("/api/files/upload")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .insert_header(("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}")))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: Value = test::read_body_json(resp).await;
        assert_eq!(created["status"], "Approved");
        assert_eq!(created["fileType"], "PDF");
        assert!(created.get("fileChunks").is_none());

        let id = created["id"].as_str().unwrap().to_string();
        let req = test::TestRequest::get()
            .uri(&format!("/api/files/{id}/download"))
            .insert_header((ROLL_HEADER, "21CS200"))
            .insert_header((ROLE_HEADER, "Student"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"paging_notes.pdf\""
        );
        assert_eq!(test::read_body(resp).await, Bytes::from_static(b"pages and frames"));
    }

    #[actix_web::test]
    async fn upload_without_a_file_is_rejected() {
        let app = test::init_service(App::new().app_data(Data::new(campus())).configure(routes)).await;

        let body = format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nEmpty\r\n--{BOUNDARY}--\r\n");
        let req = test::TestRequest::post()
            .uri("/api/files/upload")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .insert_header(("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}")))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn reset_requires_the_phrase() {
        let campus = campus();
        campus.add_subject(&campus.login("ADMIN01").await.unwrap(), "CS101").await.unwrap();
        let app = test::init_service(App::new().app_data(Data::new(campus.clone())).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/admin/reset")
            .insert_header((ROLL_HEADER, "ADMIN01"))
            .insert_header((ROLE_HEADER, "Admin"))
            .set_json(json!({ "confirmation": "yes" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(campus.subjects().await.unwrap().len(), 1);

        let req = test::TestRequest::post()
            .uri("/api/admin/reset")
            .insert_header((ROLL_HEADER, "ADMIN01"))
            .insert_header((ROLE_HEADER, "Admin"))
            .set_json(json!({ "confirmation": crate::handlers::RESET_PHRASE }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
        assert!(campus.subjects().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn insights_fail_open_without_a_key() {
        let app = test::init_service(
            App::new()
                .app_data(Data::new(campus()))
                .app_data(Data::new(ExamInsights::new(&Config::default())))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/insights")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .set_json(json!({ "syllabus": "Unit 1: Graphs" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["insights"].as_str().unwrap().starts_with("Error: "));
    }

    #[actix_web::test]
    async fn unknown_live_collections_are_not_found() {
        let app = test::init_service(App::new().app_data(Data::new(campus())).configure(routes)).await;

        let req = test::TestRequest::get()
            .uri("/api/live/passwords")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/live/logs")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn text_fields_have_their_own_limit_and_must_be_utf8() {
        let app = test::init_service(App::new().app_data(Data::new(campus())).configure(routes)).await;

        let long_title = "t".repeat(TEXT_FIELD_LIMIT as usize + 1);
        let body = multipart_body(
            &[("title", long_title.as_str())],
            ("notes.txt", "text/plain", b"short"),
        );
        let req = test::TestRequest::post()
            .uri("/api/files/upload")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .insert_header(("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}")))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let message = String::from_utf8_lossy(&test::read_body(resp).await).into_owned();
        assert!(message.contains("form field 'title' exceeds"), "{message}");

        let mut body =
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\n").into_bytes();
        body.extend_from_slice(&[0xff, 0xfe, 0xfd]);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        let req = test::TestRequest::post()
            .uri("/api/files/upload")
            .insert_header((ROLL_HEADER, "21CS102"))
            .insert_header((ROLE_HEADER, "Student"))
            .insert_header(("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}")))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let message = String::from_utf8_lossy(&test::read_body(resp).await).into_owned();
        assert!(message.contains("not valid UTF-8"), "{message}");
    }

    #[actix_web::test]
    async fn live_feed_holds_only_the_latest_snapshot() {
        let campus = campus();
        let session = campus.login("21CS102").await.unwrap();
        let (tx, mut rx) = watch::channel(None);
        let _subscription = subscribe_for(&campus, &session, StorePath::Subjects, tx);

        for i in 0..200 {
            campus
                .sync()
                .push(StorePath::Subjects, &json!({ "name": format!("S{i}") }))
                .await
                .unwrap();
        }

        // Nobody reads while the writes land; the channel only ever holds one value.
        let settled = timeout(WAIT, async {
            loop {
                let len = rx
                    .borrow()
                    .as_deref()
                    .map(|json| serde_json::from_str::<Vec<Value>>(json).unwrap().len());
                if len == Some(200) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok());

        let latest = rx.borrow_and_update().clone().unwrap();
        let records: Vec<Value> = serde_json::from_str(&latest).unwrap();
        assert_eq!(records.len(), 200);
        assert_eq!(records[199]["name"], "S199");
    }

    #[actix_web::test]
    async fn live_files_follow_visibility_and_stop_with_the_stream() {
        let campus = campus();
        let admin = campus.login("ADMIN01").await.unwrap();
        let owner = campus.login("21CS102").await.unwrap();
        let other = campus.login("21CS200").await.unwrap();

        let theirs = campus.add_file(&other, new_file("Theirs")).await.unwrap();
        campus.add_file(&owner, new_file("Mine")).await.unwrap();

        let (tx, rx) = watch::channel(None);
        let mut released = rx.clone();
        let subscription = subscribe_for(&campus, &owner, StorePath::Files, tx);
        let mut events = Box::pin(live_events(rx, subscription));

        let first = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
        let files = event_records(&first);
        let titles: Vec<&str> = files.iter().map(|f| f["title"].as_str().unwrap()).collect();
        assert_eq!(titles, vec!["Mine"]);
        assert!(files.iter().all(|f| f.get("fileChunks").is_none()));

        campus.approve_file(&admin, &theirs.id).await.unwrap();
        loop {
            let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
            let files = event_records(&event);
            assert!(files.iter().all(|f| f.get("fileChunks").is_none()));
            if files.len() == 2 {
                break;
            }
        }

        drop(events);
        // The listener owned the only sender, so the channel closes once it is released.
        let closed = timeout(WAIT, async { while released.changed().await.is_ok() {} }).await;
        assert!(closed.is_ok());
    }
}
