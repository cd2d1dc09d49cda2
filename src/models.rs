use serde::{Deserialize, Serialize};
use diesel::prelude::*;
use crate::schema::*;

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = documents, treat_none_as_null = true)]
pub struct Document {
    pub id: uuid::Uuid,
    pub title: String,
    pub status: DocumentStatus,
    pub file_path: String,
    pub signed_file_path: Option<String>,
    pub signing_token: Option<String>,
    pub user_id: uuid::Uuid,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = signature_fields, treat_none_as_null = true)]
pub struct SignatureField {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub page_number: i32,
    pub x_position: f64,
    pub y_position: f64,
    pub width: f64,
    pub height: f64,
    pub signer_email: Option<String>,
    pub status: FieldStatus,
    pub signature_data: Option<String>,
}

#[derive(Insertable, Queryable, Identifiable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = audit_logs)]
pub struct AuditLog {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub action: AuditAction,
    pub user_id: Option<uuid::Uuid>,
    pub details: String,
    pub created_at: chrono::NaiveDateTime,
}

impl Document {
    pub fn new(title: String, file_path: String, user_id: uuid::Uuid) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            title,
            status: DocumentStatus::Draft,
            file_path,
            signed_file_path: None,
            signing_token: None,
            user_id,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

impl SignatureField {
    /// The assigned signer, ignoring blank assignments.
    pub fn signer(&self) -> Option<&str> {
        self.signer_email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    pub fn is_signed(&self) -> bool {
        self.status == FieldStatus::Signed
    }
}

impl AuditLog {
    pub fn new(document_id: uuid::Uuid, event: crate::signing::AuditEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            document_id,
            action: event.action,
            user_id: event.user_id,
            details: event.details,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}
