use diesel::prelude::*;
use crate::{models, schema};
use crate::schema::{DocumentStatus, FieldStatus};
use crate::signing::AuditEvent;

pub fn document(c: &mut PgConnection, did: uuid::Uuid) -> QueryResult<Option<models::Document>> {
    schema::documents::dsl::documents.find(did)
        .first::<models::Document>(c)
        .optional()
}

/// Loads and row-locks a document for the rest of the transaction.
pub fn lock_document(c: &mut PgConnection, did: uuid::Uuid) -> QueryResult<Option<models::Document>> {
    schema::documents::dsl::documents.find(did)
        .for_update()
        .first::<models::Document>(c)
        .optional()
}

pub fn lock_document_by_token(c: &mut PgConnection, token: &str) -> QueryResult<Option<models::Document>> {
    schema::documents::dsl::documents.filter(
        schema::documents::dsl::signing_token.eq(token)
    )
        .for_update()
        .first::<models::Document>(c)
        .optional()
}

pub fn document_by_token(c: &mut PgConnection, token: &str) -> QueryResult<Option<models::Document>> {
    schema::documents::dsl::documents.filter(
        schema::documents::dsl::signing_token.eq(token)
    ).first::<models::Document>(c).optional()
}

pub fn owned_documents(c: &mut PgConnection, user_id: uuid::Uuid) -> QueryResult<Vec<models::Document>> {
    schema::documents::dsl::documents.filter(
        schema::documents::dsl::user_id.eq(user_id)
    )
        .order_by(schema::documents::dsl::created_at.desc())
        .load::<models::Document>(c)
}

pub fn fields(c: &mut PgConnection, did: uuid::Uuid) -> QueryResult<Vec<models::SignatureField>> {
    schema::signature_fields::dsl::signature_fields.filter(
        schema::signature_fields::dsl::document_id.eq(did)
    )
        .order_by((schema::signature_fields::dsl::page_number.asc(), schema::signature_fields::dsl::id.asc()))
        .load::<models::SignatureField>(c)
}

pub fn fields_for(c: &mut PgConnection, dids: &[uuid::Uuid]) -> QueryResult<Vec<models::SignatureField>> {
    schema::signature_fields::dsl::signature_fields.filter(
        schema::signature_fields::dsl::document_id.eq_any(dids)
    )
        .order_by((schema::signature_fields::dsl::page_number.asc(), schema::signature_fields::dsl::id.asc()))
        .load::<models::SignatureField>(c)
}

pub fn insert_document(c: &mut PgConnection, document: &models::Document) -> QueryResult<()> {
    diesel::insert_into(schema::documents::dsl::documents)
        .values(document)
        .execute(c)?;
    Ok(())
}

pub fn save_document(c: &mut PgConnection, document: &models::Document) -> QueryResult<()> {
    diesel::update(document).set(document).execute(c)?;
    Ok(())
}

/// Records the signed artifact, unless the document was recalled in the meantime.
pub fn set_signed_file_path(c: &mut PgConnection, did: uuid::Uuid, path: &str) -> QueryResult<bool> {
    let updated = diesel::update(schema::documents::dsl::documents.filter(
        schema::documents::dsl::id.eq(did).and(
            schema::documents::dsl::status.eq(DocumentStatus::Completed)
        )
    ))
        .set(schema::documents::dsl::signed_file_path.eq(path))
        .execute(c)?;
    Ok(updated == 1)
}

pub fn count_unsigned(c: &mut PgConnection, did: uuid::Uuid) -> QueryResult<i64> {
    schema::signature_fields::dsl::signature_fields.filter(
        schema::signature_fields::dsl::document_id.eq(did).and(
            schema::signature_fields::dsl::status.ne(FieldStatus::Signed)
        )
    )
        .count()
        .get_result(c)
}

/// Marks a pending document completed. Returns whether this call made the transition.
pub fn complete_document(c: &mut PgConnection, did: uuid::Uuid) -> QueryResult<bool> {
    let updated = diesel::update(schema::documents::dsl::documents.filter(
        schema::documents::dsl::id.eq(did).and(
            schema::documents::dsl::status.eq(DocumentStatus::Pending)
        )
    ))
        .set(schema::documents::dsl::status.eq(DocumentStatus::Completed))
        .execute(c)?;
    Ok(updated == 1)
}

pub fn insert_field(c: &mut PgConnection, field: &models::SignatureField) -> QueryResult<()> {
    diesel::insert_into(schema::signature_fields::dsl::signature_fields)
        .values(field)
        .execute(c)?;
    Ok(())
}

pub fn save_field(c: &mut PgConnection, field: &models::SignatureField) -> QueryResult<()> {
    diesel::update(field).set(field).execute(c)?;
    Ok(())
}

pub fn save_fields(c: &mut PgConnection, fields: &[models::SignatureField]) -> QueryResult<()> {
    for field in fields {
        save_field(c, field)?;
    }
    Ok(())
}

pub fn delete_field(c: &mut PgConnection, field: &models::SignatureField) -> QueryResult<()> {
    diesel::delete(field).execute(c)?;
    Ok(())
}

pub fn append_audit(c: &mut PgConnection, did: uuid::Uuid, event: AuditEvent) -> QueryResult<()> {
    diesel::insert_into(schema::audit_logs::dsl::audit_logs)
        .values(&models::AuditLog::new(did, event))
        .execute(c)?;
    Ok(())
}

pub fn audit_log(c: &mut PgConnection, did: uuid::Uuid) -> QueryResult<Vec<models::AuditLog>> {
    schema::audit_logs::dsl::audit_logs.filter(
        schema::audit_logs::dsl::document_id.eq(did)
    )
        .order_by(schema::audit_logs::dsl::created_at.desc())
        .load::<models::AuditLog>(c)
}
