use diesel::Connection;
use itertools::Itertools;
use log::{error, info, warn};
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use crate::{models, signing, store, Config, DbConn, DocumentID, Error, FieldID};
use crate::auth::User;
use crate::compositor::Compositor;
use crate::error::ErrorBody;
use crate::files::file_url;
use crate::notify::Mailer;
use crate::schema::{AuditAction, DocumentStatus, FieldStatus};
use crate::signing::Actor;

pub use crate::files::authenticated_files;

#[derive(Serialize, Debug)]
pub struct FieldResponse {
    pub id: FieldID,
    pub document_id: DocumentID,
    pub page_number: i32,
    pub x_position: f64,
    pub y_position: f64,
    pub width: f64,
    pub height: f64,
    pub signer_email: Option<String>,
    pub status: FieldStatus,
    pub signature_data: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct DocumentResponse {
    pub id: DocumentID,
    pub title: String,
    pub status: DocumentStatus,
    pub file_path: String,
    pub file_url: String,
    pub signed_file_path: Option<String>,
    pub signed_file_url: Option<String>,
    pub signing_token: Option<String>,
    pub user_id: uuid::Uuid,
    pub created_at: chrono::NaiveDateTime,
    pub signature_fields: Vec<FieldResponse>,
}

#[derive(Serialize, Debug)]
pub struct AuditLogResponse {
    pub id: uuid::Uuid,
    pub action: AuditAction,
    pub user_id: Option<uuid::Uuid>,
    pub details: String,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Serialize, Debug)]
pub struct Health {
    pub status: &'static str,
}

#[derive(Deserialize, Debug)]
pub struct FieldCreate {
    pub page_number: i32,
    pub x_position: f64,
    pub y_position: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub signer_email: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct FieldUpdate {
    #[serde(default)]
    pub signer_email: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct SignatureUpdate {
    pub signature_data: String,
}

#[derive(FromForm)]
pub struct UploadForm<'r> {
    file: rocket::fs::TempFile<'r>,
}

impl From<models::SignatureField> for FieldResponse {
    fn from(field: models::SignatureField) -> Self {
        Self {
            id: FieldID::new(field.id),
            document_id: DocumentID::new(field.document_id),
            page_number: field.page_number,
            x_position: field.x_position,
            y_position: field.y_position,
            width: field.width,
            height: field.height,
            signer_email: field.signer_email,
            status: field.status,
            signature_data: field.signature_data,
        }
    }
}

impl From<models::AuditLog> for AuditLogResponse {
    fn from(entry: models::AuditLog) -> Self {
        Self {
            id: entry.id,
            action: entry.action,
            user_id: entry.user_id,
            details: entry.details,
            created_at: entry.created_at,
        }
    }
}

impl DocumentResponse {
    fn new(document: models::Document, fields: Vec<models::SignatureField>, config: &Config) -> Self {
        Self {
            id: DocumentID::new(document.id),
            file_url: file_url(&document.file_path, &config.files_key),
            signed_file_url: document.signed_file_path.as_deref().map(|p| file_url(p, &config.files_key)),
            title: document.title,
            status: document.status,
            file_path: document.file_path,
            signed_file_path: document.signed_file_path,
            signing_token: document.signing_token,
            user_id: document.user_id,
            created_at: document.created_at,
            signature_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl FieldCreate {
    fn validate(&self) -> Result<(), Error> {
        if self.page_number < 1 {
            return Err(Error::Validation("Page number must be at least 1".to_string()));
        }
        if !self.x_position.is_finite() || !self.y_position.is_finite() {
            return Err(Error::Validation("Field position must be a finite number".to_string()));
        }
        if !(self.width.is_finite() && self.width > 0.0 && self.height.is_finite() && self.height > 0.0) {
            return Err(Error::Validation("Field width and height must be positive".to_string()));
        }
        Ok(())
    }
}

fn normalize_signer(email: Option<String>) -> Option<String> {
    email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty())
}

type Loaded = (models::Document, Vec<models::SignatureField>);

fn lock_document(c: &mut diesel::PgConnection, did: uuid::Uuid) -> Result<Loaded, Error> {
    let document = match store::lock_document(c, did)? {
        Some(d) => d,
        None => return Err(Error::not_found("Document"))
    };
    let fields = store::fields(c, document.id)?;
    Ok((document, fields))
}

fn lock_document_by_token(c: &mut diesel::PgConnection, token: &str) -> Result<Loaded, Error> {
    let document = match store::lock_document_by_token(c, token)? {
        Some(d) => d,
        None => return Err(Error::not_found("Document"))
    };
    let fields = store::fields(c, document.id)?;
    Ok((document, fields))
}

async fn load_document(did: uuid::Uuid, db: &DbConn) -> Result<Loaded, Error> {
    crate::db_run(db, move |c| {
        let document = match store::document(c, did)? {
            Some(d) => d,
            None => return Err(Error::not_found("Document"))
        };
        let fields = store::fields(c, document.id)?;
        Ok((document, fields))
    }).await
}

async fn load_document_by_token(token: String, db: &DbConn) -> Result<Loaded, Error> {
    crate::db_run(db, move |c| {
        let document = match store::document_by_token(c, &token)? {
            Some(d) => d,
            None => return Err(Error::not_found("Document"))
        };
        let fields = store::fields(c, document.id)?;
        Ok((document, fields))
    }).await
}

fn take_field(fields: Vec<models::SignatureField>, fid: uuid::Uuid) -> Result<models::SignatureField, Error> {
    match fields.into_iter().find(|f| f.id == fid) {
        Some(f) => Ok(f),
        None => Err(Error::not_found("Field"))
    }
}

struct Signed {
    field: models::SignatureField,
    completed: Option<Loaded>,
}

/// Records one signature inside the caller's transaction, completing the
/// document with a compare-and-set when no unsigned fields remain.
fn apply_signature(
    c: &mut diesel::PgConnection, loaded: Loaded, fid: uuid::Uuid, actor: Actor, signature_data: &str,
) -> Result<Signed, Error> {
    let (mut document, mut fields) = loaded;
    let outcome = signing::sign_field(&mut document, &mut fields, fid, actor, signature_data)?;

    let field = match fields.iter().find(|f| f.id == fid) {
        Some(f) => f.clone(),
        None => return Err(Error::not_found("Field"))
    };
    store::save_field(c, &field)?;
    store::append_audit(c, document.id, outcome.signed)?;

    let completed = match outcome.completed {
        Some(event) => {
            if store::count_unsigned(c, document.id)? == 0 && store::complete_document(c, document.id)? {
                store::append_audit(c, document.id, event)?;
                Some((document, fields))
            } else {
                warn!("{} was not pending at completion, skipping compositing", DocumentID::new(document.id));
                None
            }
        }
        None => None
    };

    Ok(Signed {
        field,
        completed,
    })
}

async fn finish_signing(signed: Signed, db: &DbConn, compositor: &Compositor) -> Result<Json<FieldResponse>, Error> {
    if let Some((document, fields)) = signed.completed {
        let did = document.id;
        info!("{} fully signed", DocumentID::new(did));

        if let Some(signed_path) = compositor.composite(&document, fields).await {
            let res = crate::db_run(db, move |c| {
                Ok(store::set_signed_file_path(c, did, &signed_path)?)
            }).await;
            signed_path_recorded(did, res);
        }
    }

    Ok(Json(signed.field.into()))
}

/// The signature is already committed at this point, so failures are only logged.
fn signed_path_recorded(did: uuid::Uuid, res: Result<bool, Error>) -> bool {
    match res {
        Ok(true) => true,
        Ok(false) => {
            warn!("{} changed state during compositing, signed file not recorded", DocumentID::new(did));
            false
        }
        Err(err) => {
            error!("Unable to record signed file for {}: {}", DocumentID::new(did), err);
            false
        }
    }
}

/// Removes an uploaded file again when the document row could not be created.
async fn discard_upload<T>(path: &std::path::Path, res: Result<T, Error>) -> Result<T, Error> {
    if res.is_err() {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!("Unable to remove orphaned upload {}: {}", path.display(), err);
        }
    }
    res
}

#[get("/")]
pub fn index() -> Json<Health> {
    Json(Health {
        status: "ok",
    })
}

#[get("/api/health")]
pub fn health() -> Json<Health> {
    Json(Health {
        status: "healthy",
    })
}

#[post("/api/docs/upload?<title>", data = "<upload>")]
pub async fn upload(
    title: &str, mut upload: rocket::form::Form<UploadForm<'_>>, user: User, db: DbConn,
    config: &rocket::State<Config>,
) -> Result<Json<DocumentResponse>, Error> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::Validation("A title is required".to_string()));
    }
    if !upload.file.content_type().map_or(false, |c| c.is_pdf()) {
        return Err(Error::Validation("Only PDF files are allowed".to_string()));
    }

    let file_name = format!("{}.pdf", uuid::Uuid::new_v4());
    let file_path = config.files_dir.join(&file_name);
    upload.file.copy_to(&file_path).await?;

    let document = models::Document::new(title.to_string(), file_name, user.id);
    let res = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            store::insert_document(c, &document)?;
            store::append_audit(c, document.id, signing::AuditEvent::upload(&document))?;
            Ok(document)
        })
    }).await;
    let document = discard_upload(&file_path, res).await?;

    info!("{} uploaded {}", user.email, DocumentID::new(document.id));
    Ok(Json(DocumentResponse::new(document, vec![], config)))
}

#[get("/api/docs")]
pub async fn documents(user: User, db: DbConn, config: &rocket::State<Config>) -> Result<Json<Vec<DocumentResponse>>, Error> {
    let (documents, fields) = crate::db_run(&db, move |c| {
        let documents = store::owned_documents(c, user.id)?;
        let dids = documents.iter().map(|d| d.id).collect::<Vec<_>>();
        let fields = store::fields_for(c, &dids)?;
        Ok((documents, fields))
    }).await?;

    let mut fields = fields.into_iter().into_group_map_by(|f| f.document_id);
    Ok(Json(documents.into_iter().map(|d| {
        let document_fields = fields.remove(&d.id).unwrap_or_default();
        DocumentResponse::new(d, document_fields, config)
    }).collect()))
}

#[get("/api/docs/<did>")]
pub async fn document(did: DocumentID, user: User, db: DbConn, config: &rocket::State<Config>) -> Result<Json<DocumentResponse>, Error> {
    let (document, fields) = load_document(did.uuid, &db).await?;
    signing::ensure_access(&document, &fields, &user)?;
    Ok(Json(DocumentResponse::new(document, fields, config)))
}

#[post("/api/docs/<did>/fields", data = "<field>")]
pub async fn add_field(did: DocumentID, field: Json<FieldCreate>, user: User, db: DbConn) -> Result<Json<FieldResponse>, Error> {
    let field = field.into_inner();
    field.validate()?;

    let field = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (document, _) = lock_document(c, did.uuid)?;
            signing::ensure_owner(&document, &user)?;
            document.status.check_editable()?;

            let new_field = models::SignatureField {
                id: uuid::Uuid::new_v4(),
                document_id: document.id,
                page_number: field.page_number,
                x_position: field.x_position,
                y_position: field.y_position,
                width: field.width,
                height: field.height,
                signer_email: normalize_signer(field.signer_email),
                status: FieldStatus::Pending,
                signature_data: None,
            };
            store::insert_field(c, &new_field)?;
            Ok(new_field)
        })
    }).await?;

    Ok(Json(field.into()))
}

#[patch("/api/docs/<did>/fields/<fid>", data = "<update>")]
pub async fn update_field(did: DocumentID, fid: FieldID, update: Json<FieldUpdate>, user: User, db: DbConn) -> Result<Json<FieldResponse>, Error> {
    let update = update.into_inner();

    let field = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (document, fields) = lock_document(c, did.uuid)?;
            signing::ensure_owner(&document, &user)?;

            let mut field = take_field(fields, fid.uuid)?;
            if update.signer_email.is_some() {
                field.signer_email = normalize_signer(update.signer_email);
            }
            store::save_field(c, &field)?;
            Ok(field)
        })
    }).await?;

    Ok(Json(field.into()))
}

#[delete("/api/docs/<did>/fields/<fid>")]
pub async fn delete_field(did: DocumentID, fid: FieldID, user: User, db: DbConn) -> Result<rocket::http::Status, Error> {
    crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (document, fields) = lock_document(c, did.uuid)?;
            signing::ensure_owner(&document, &user)?;
            document.status.check_editable()?;

            let field = take_field(fields, fid.uuid)?;
            store::delete_field(c, &field)?;
            Ok(())
        })
    }).await?;

    Ok(rocket::http::Status::NoContent)
}

#[put("/api/docs/<did>/send")]
pub async fn send(
    did: DocumentID, user: User, db: DbConn, config: &rocket::State<Config>, mailer: &rocket::State<Mailer>,
) -> Result<Json<DocumentResponse>, Error> {
    let sender = user.clone();
    let (document, fields) = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (mut document, fields) = lock_document(c, did.uuid)?;
            let event = signing::send(&mut document, &fields, &user)?;
            store::save_document(c, &document)?;
            store::append_audit(c, document.id, event)?;
            Ok((document, fields))
        })
    }).await?;

    let notified = mailer.send_signing_requests(&document, &fields, sender.display_name()).await;
    info!("{} sent for signing, {} signer(s) notified", DocumentID::new(document.id), notified);

    Ok(Json(DocumentResponse::new(document, fields, config)))
}

#[post("/api/docs/<did>/fields/<fid>/sign", data = "<data>", rank = 2)]
pub async fn sign_field(
    did: DocumentID, fid: FieldID, data: Json<SignatureUpdate>, user: User, db: DbConn,
    compositor: &rocket::State<Compositor>,
) -> Result<Json<FieldResponse>, Error> {
    let data = data.into_inner();
    let signed = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let loaded = lock_document(c, did.uuid)?;
            apply_signature(c, loaded, fid.uuid, Actor::User(&user), &data.signature_data)
        })
    }).await?;

    finish_signing(signed, &db, compositor).await
}

#[post("/api/docs/<did>/decline?<reason>", rank = 2)]
pub async fn decline(
    did: DocumentID, reason: Option<String>, user: User, db: DbConn, config: &rocket::State<Config>,
) -> Result<Json<DocumentResponse>, Error> {
    let (document, fields) = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (mut document, fields) = lock_document(c, did.uuid)?;
            let event = signing::decline(&mut document, &fields, Actor::User(&user), reason.as_deref())?;
            store::save_document(c, &document)?;
            store::append_audit(c, document.id, event)?;
            Ok((document, fields))
        })
    }).await?;

    Ok(Json(DocumentResponse::new(document, fields, config)))
}

#[post("/api/docs/<did>/recall")]
pub async fn recall(did: DocumentID, user: User, db: DbConn, config: &rocket::State<Config>) -> Result<Json<DocumentResponse>, Error> {
    let (document, fields) = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (mut document, mut fields) = lock_document(c, did.uuid)?;
            let event = signing::recall(&mut document, &mut fields, &user)?;
            store::save_document(c, &document)?;
            store::save_fields(c, &fields)?;
            store::append_audit(c, document.id, event)?;
            Ok((document, fields))
        })
    }).await?;

    info!("{} recalled to draft", DocumentID::new(document.id));
    Ok(Json(DocumentResponse::new(document, fields, config)))
}

#[get("/api/docs/<did>/audit", rank = 2)]
pub async fn audit_log(did: DocumentID, user: User, db: DbConn) -> Result<Json<Vec<AuditLogResponse>>, Error> {
    let entries = crate::db_run(&db, move |c| {
        let document = match store::document(c, did.uuid)? {
            Some(d) => d,
            None => return Err(Error::not_found("Document"))
        };
        signing::ensure_owner(&document, &user)?;
        Ok(store::audit_log(c, document.id)?)
    }).await?;

    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

#[get("/api/docs/public/<token>", rank = 1)]
pub async fn public_document(token: String, db: DbConn, config: &rocket::State<Config>) -> Result<Json<DocumentResponse>, Error> {
    let (document, fields) = load_document_by_token(token, &db).await?;
    Ok(Json(DocumentResponse::new(document, fields, config)))
}

#[post("/api/docs/public/<token>/fields/<fid>/sign", data = "<data>", rank = 1)]
pub async fn public_sign_field(
    token: String, fid: FieldID, data: Json<SignatureUpdate>, db: DbConn, compositor: &rocket::State<Compositor>,
) -> Result<Json<FieldResponse>, Error> {
    let data = data.into_inner();
    let signed = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let loaded = lock_document_by_token(c, &token)?;
            apply_signature(c, loaded, fid.uuid, Actor::Public, &data.signature_data)
        })
    }).await?;

    finish_signing(signed, &db, compositor).await
}

#[post("/api/docs/public/<token>/decline?<reason>", rank = 1)]
pub async fn public_decline(
    token: String, reason: Option<String>, db: DbConn, config: &rocket::State<Config>,
) -> Result<Json<DocumentResponse>, Error> {
    let (document, fields) = crate::db_run(&db, move |c| {
        c.transaction::<_, Error, _>(|c| {
            let (mut document, fields) = lock_document_by_token(c, &token)?;
            let event = signing::decline(&mut document, &fields, Actor::Public, reason.as_deref())?;
            store::save_document(c, &document)?;
            store::append_audit(c, document.id, event)?;
            Ok((document, fields))
        })
    }).await?;

    Ok(Json(DocumentResponse::new(document, fields, config)))
}

#[catch(401)]
pub fn unauthorized() -> Json<ErrorBody> {
    Json(ErrorBody {
        detail: "Could not validate credentials".to_string(),
    })
}

#[catch(default)]
pub fn default_catcher(status: rocket::http::Status, _req: &rocket::Request) -> (rocket::http::Status, Json<ErrorBody>) {
    (status, Json(ErrorBody {
        detail: status.reason_lossy().to_string(),
    }))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![
        index,
        health,
        upload,
        documents,
        document,
        add_field,
        update_field,
        delete_field,
        send,
        sign_field,
        decline,
        recall,
        audit_log,
        public_document,
        public_sign_field,
        public_decline,
        authenticated_files,
    ]
}

pub fn catchers() -> Vec<rocket::Catcher> {
    catchers![unauthorized, default_catcher]
}
