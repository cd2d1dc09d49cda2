use serde::{Deserialize, Serialize};

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Pending,
    Completed,
    Declined,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Declined => "declined",
        })
    }
}

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldStatus {
    Pending,
    Signed,
}

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Upload,
    Send,
    Sign,
    Recall,
    Decline,
    Complete,
}

diesel::table! {
    use diesel::sql_types::*;
    use crate::schema::DocumentStatusMapping;

    documents (id) {
        id -> Uuid,
        title -> Varchar,
        status -> DocumentStatusMapping,
        file_path -> Varchar,
        signed_file_path -> Nullable<Varchar>,
        signing_token -> Nullable<Varchar>,
        user_id -> Uuid,
        created_at -> Timestamp,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use crate::schema::FieldStatusMapping;

    signature_fields (id) {
        id -> Uuid,
        document_id -> Uuid,
        page_number -> Int4,
        x_position -> Float8,
        y_position -> Float8,
        width -> Float8,
        height -> Float8,
        signer_email -> Nullable<Varchar>,
        status -> FieldStatusMapping,
        signature_data -> Nullable<Text>,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use crate::schema::AuditActionMapping;

    audit_logs (id) {
        id -> Uuid,
        document_id -> Uuid,
        action -> AuditActionMapping,
        user_id -> Nullable<Uuid>,
        details -> Text,
        created_at -> Timestamp,
    }
}

diesel::joinable!(signature_fields -> documents (document_id));
diesel::joinable!(audit_logs -> documents (document_id));

diesel::allow_tables_to_appear_in_same_query!(
    documents,
    signature_fields,
    audit_logs,
);
