//! Document lifecycle rules.
//!
//! Every operation here works on already loaded (and locked) rows, mutates
//! them in place and returns the audit events the caller persists in the same
//! transaction. Nothing in this module touches the database.

use rand::Rng;
use crate::auth::User;
use crate::models::{Document, SignatureField};
use crate::schema::{AuditAction, DocumentStatus, FieldStatus};
use crate::Error;

pub const DEFAULT_DECLINE_REASON: &str = "No reason provided";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub user_id: Option<uuid::Uuid>,
    pub details: String,
}

impl AuditEvent {
    fn new<S: Into<String>>(action: AuditAction, user_id: Option<uuid::Uuid>, details: S) -> Self {
        Self {
            action,
            user_id,
            details: details.into(),
        }
    }

    pub fn upload(document: &Document) -> Self {
        Self::new(AuditAction::Upload, Some(document.user_id), format!("Document '{}' uploaded", document.title))
    }
}

/// Who is acting on a document: an authenticated user, or whoever holds the signing link.
#[derive(Debug, Clone, Copy)]
pub enum Actor<'a> {
    User(&'a User),
    Public,
}

impl Actor<'_> {
    fn user_id(&self) -> Option<uuid::Uuid> {
        match self {
            Actor::User(u) => Some(u.id),
            Actor::Public => None,
        }
    }
}

#[derive(Debug)]
pub struct SignOutcome {
    pub signed: AuditEvent,
    /// Present when this signature was the last one outstanding.
    pub completed: Option<AuditEvent>,
}

pub fn make_signing_token() -> String {
    base64::encode_config(
        rand::thread_rng()
            .sample_iter(rand::distributions::Standard)
            .take(32)
            .collect::<Vec<u8>>(),
        base64::URL_SAFE_NO_PAD,
    )
}

pub fn same_email(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

pub fn is_signer(fields: &[SignatureField], email: &str) -> bool {
    fields.iter().any(|f| f.signer().map_or(false, |s| same_email(s, email)))
}

pub fn has_access(document: &Document, fields: &[SignatureField], user: &User) -> bool {
    document.user_id == user.id || is_signer(fields, &user.email)
}

pub fn ensure_owner(document: &Document, user: &User) -> Result<(), Error> {
    if document.user_id != user.id {
        return Err(Error::Forbidden("Not authorized".to_string()));
    }
    Ok(())
}

pub fn ensure_access(document: &Document, fields: &[SignatureField], user: &User) -> Result<(), Error> {
    if !has_access(document, fields, user) {
        return Err(Error::Forbidden("Not authorized".to_string()));
    }
    Ok(())
}

impl DocumentStatus {
    fn already(self) -> Error {
        Error::Validation(format!("Document is already {}", self))
    }

    pub fn check_editable(self) -> Result<(), Error> {
        match self {
            DocumentStatus::Draft => Ok(()),
            s => Err(Error::Validation(format!("Fields can only be changed while the document is draft, it is {}", s))),
        }
    }

    pub fn check_sendable(self) -> Result<(), Error> {
        match self {
            DocumentStatus::Draft | DocumentStatus::Pending => Ok(()),
            s => Err(s.already()),
        }
    }

    pub fn check_signable(self) -> Result<(), Error> {
        match self {
            DocumentStatus::Pending => Ok(()),
            DocumentStatus::Draft => Err(Error::Validation("Document has not been sent for signing".to_string())),
            s => Err(s.already()),
        }
    }

    pub fn check_declinable(self) -> Result<(), Error> {
        match self {
            DocumentStatus::Draft | DocumentStatus::Pending => Ok(()),
            s => Err(s.already()),
        }
    }

    pub fn check_recallable(self) -> Result<(), Error> {
        match self {
            DocumentStatus::Draft => Err(DocumentStatus::Draft.already()),
            _ => Ok(()),
        }
    }
}

pub fn send(document: &mut Document, fields: &[SignatureField], user: &User) -> Result<AuditEvent, Error> {
    ensure_owner(document, user)?;
    document.status.check_sendable()?;

    if fields.is_empty() {
        return Err(Error::Validation("Document has no signature fields".to_string()));
    }

    if document.signing_token.is_none() {
        document.signing_token = Some(make_signing_token());
    }
    document.status = DocumentStatus::Pending;

    Ok(AuditEvent::new(AuditAction::Send, Some(user.id), "Document sent for signing"))
}

/// Applies a signature to one field, completing the document when it was the last one outstanding.
pub fn sign_field(
    document: &mut Document, fields: &mut [SignatureField], field_id: uuid::Uuid, actor: Actor, signature_data: &str,
) -> Result<SignOutcome, Error> {
    if let Actor::User(user) = actor {
        ensure_access(document, fields, user)?;
    }
    document.status.check_signable()?;

    let signature_data = signature_data.trim();
    if signature_data.is_empty() {
        return Err(Error::Validation("Signature data is required".to_string()));
    }

    let field = match fields.iter_mut().find(|f| f.id == field_id) {
        Some(f) => f,
        None => return Err(Error::not_found("Signature field"))
    };

    if let (Actor::User(user), Some(signer)) = (actor, field.signer()) {
        if !same_email(signer, &user.email) {
            return Err(Error::Forbidden(format!("Access denied. This field is assigned to {}", signer)));
        }
    }

    field.status = FieldStatus::Signed;
    field.signature_data = Some(signature_data.to_string());

    let details = match actor {
        Actor::User(_) => format!("Signature applied to field {}", crate::FieldID::new(field.id)),
        Actor::Public => format!("Signature applied via public link (Field {})", crate::FieldID::new(field.id)),
    };
    let signed = AuditEvent::new(AuditAction::Sign, actor.user_id(), details);

    let completed = if fields.iter().all(SignatureField::is_signed) {
        document.status = DocumentStatus::Completed;
        Some(AuditEvent::new(AuditAction::Complete, actor.user_id(), "All fields signed. Document completed."))
    } else {
        None
    };

    Ok(SignOutcome {
        signed,
        completed,
    })
}

pub fn decline(document: &mut Document, fields: &[SignatureField], actor: Actor, reason: Option<&str>) -> Result<AuditEvent, Error> {
    if let Actor::User(user) = actor {
        if !has_access(document, fields, user) {
            return Err(Error::Forbidden("Not authorized to decline this document".to_string()));
        }
    }
    document.status.check_declinable()?;

    let reason = reason.map(str::trim).filter(|r| !r.is_empty()).unwrap_or(DEFAULT_DECLINE_REASON);
    document.status = DocumentStatus::Declined;

    Ok(match actor {
        Actor::User(user) => AuditEvent::new(
            AuditAction::Decline, Some(user.id), format!("Document declined. Reason: {}", reason),
        ),
        Actor::Public => AuditEvent::new(
            AuditAction::Decline, None, format!("Document declined via public link. Reason: {}", reason),
        ),
    })
}

/// Returns a document to draft, discarding collected signatures but keeping field layout and signers.
pub fn recall(document: &mut Document, fields: &mut [SignatureField], user: &User) -> Result<AuditEvent, Error> {
    ensure_owner(document, user)?;
    document.status.check_recallable()?;

    document.status = DocumentStatus::Draft;
    document.signed_file_path = None;
    for field in fields.iter_mut() {
        field.status = FieldStatus::Pending;
        field.signature_data = None;
    }

    Ok(AuditEvent::new(AuditAction::Recall, Some(user.id), "Document recalled to draft mode. Signatures cleared."))
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::*;

    const SIG: &str = "data:image/png;base64,iVBORw0KGgo=";

    fn pending(owner: &User, signers: &[Option<&str>]) -> (Document, Vec<SignatureField>) {
        let mut doc = document(owner);
        let fields = signers.iter().map(|s| field(&doc, 1, *s)).collect::<Vec<_>>();
        send(&mut doc, &fields, owner).unwrap();
        (doc, fields)
    }

    fn assert_completed_implies_all_signed(doc: &Document, fields: &[SignatureField]) {
        if doc.status == DocumentStatus::Completed {
            assert!(fields.iter().all(SignatureField::is_signed));
        }
        for f in fields {
            assert_eq!(f.is_signed(), f.signature_data.is_some());
        }
    }

    #[test]
    fn send_requires_fields() {
        let owner = user("owner@example.com");
        let mut doc = document(&owner);
        let err = send(&mut doc, &[], &owner).unwrap_err();
        assert_eq!(err.to_string(), "Document has no signature fields");
        assert_eq!(doc.status, DocumentStatus::Draft);
        assert!(doc.signing_token.is_none());
    }

    #[test]
    fn repeated_send_keeps_token() {
        let owner = user("owner@example.com");
        let (mut doc, fields) = pending(&owner, &[Some("bob@example.com")]);
        let token = doc.signing_token.clone().unwrap();
        assert_eq!(token.len(), 43);

        let event = send(&mut doc, &fields, &owner).unwrap();
        assert_eq!(doc.signing_token.as_deref(), Some(token.as_str()));
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(event.action, AuditAction::Send);
        assert_eq!(event.details, "Document sent for signing");
    }

    #[test]
    fn only_owner_sends() {
        let owner = user("owner@example.com");
        let other = user("bob@example.com");
        let mut doc = document(&owner);
        let fields = vec![field(&doc, 1, Some("bob@example.com"))];
        assert!(matches!(send(&mut doc, &fields, &other), Err(Error::Forbidden(_))));
    }

    #[test]
    fn tokens_are_distinct() {
        assert_ne!(make_signing_token(), make_signing_token());
    }

    #[test]
    fn signer_mismatch_is_forbidden() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[Some("Bob@Example.com")]);
        let field_id = fields[0].id;

        let err = sign_field(&mut doc, &mut fields, field_id, Actor::User(&owner), SIG).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(err.to_string(), "Access denied. This field is assigned to Bob@Example.com");
        assert!(!fields[0].is_signed());
    }

    #[test]
    fn signer_match_ignores_case() {
        let owner = user("owner@example.com");
        let bob = user("bob@example.com");
        let (mut doc, mut fields) = pending(&owner, &[Some("BOB@example.COM"), None]);
        let field_id = fields[0].id;

        let outcome = sign_field(&mut doc, &mut fields, field_id, Actor::User(&bob), SIG).unwrap();
        assert!(outcome.completed.is_none());
        assert_eq!(outcome.signed.user_id, Some(bob.id));
        assert_eq!(outcome.signed.details, format!("Signature applied to field {}", crate::FieldID::new(field_id)));
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_completed_implies_all_signed(&doc, &fields);
    }

    #[test]
    fn strangers_cannot_sign() {
        let owner = user("owner@example.com");
        let mallory = user("mallory@example.com");
        let (mut doc, mut fields) = pending(&owner, &[None]);
        let field_id = fields[0].id;
        assert!(matches!(
            sign_field(&mut doc, &mut fields, field_id, Actor::User(&mallory), SIG),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn last_signature_completes_document() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[None, Some("bob@example.com")]);
        let (first, second) = (fields[0].id, fields[1].id);

        let outcome = sign_field(&mut doc, &mut fields, first, Actor::User(&owner), SIG).unwrap();
        assert!(outcome.completed.is_none());
        assert_eq!(doc.status, DocumentStatus::Pending);

        let outcome = sign_field(&mut doc, &mut fields, second, Actor::Public, SIG).unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(outcome.signed.details, format!("Signature applied via public link (Field {})", crate::FieldID::new(second)));
        assert_eq!(outcome.signed.user_id, None);
        let completed = outcome.completed.unwrap();
        assert_eq!(completed.action, AuditAction::Complete);
        assert_eq!(completed.details, "All fields signed. Document completed.");
        assert_completed_implies_all_signed(&doc, &fields);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[None]);
        let field_id = fields[0].id;
        assert!(matches!(
            sign_field(&mut doc, &mut fields, field_id, Actor::Public, "  "),
            Err(Error::Validation(_))
        ));
        assert!(!fields[0].is_signed());
    }

    #[test]
    fn unknown_field_is_not_found() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[None]);
        assert!(matches!(
            sign_field(&mut doc, &mut fields, uuid::Uuid::new_v4(), Actor::Public, SIG),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn draft_cannot_be_signed() {
        let owner = user("owner@example.com");
        let mut doc = document(&owner);
        let mut fields = vec![field(&doc, 1, None)];
        let field_id = fields[0].id;
        let err = sign_field(&mut doc, &mut fields, field_id, Actor::Public, SIG).unwrap_err();
        assert_eq!(err.to_string(), "Document has not been sent for signing");
    }

    #[test]
    fn decline_blocks_public_signing() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[None]);

        let event = decline(&mut doc, &fields, Actor::Public, None).unwrap();
        assert_eq!(doc.status, DocumentStatus::Declined);
        assert_eq!(event.details, "Document declined via public link. Reason: No reason provided");
        assert_eq!(event.user_id, None);

        let field_id = fields[0].id;
        let err = sign_field(&mut doc, &mut fields, field_id, Actor::Public, SIG).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.to_string(), "Document is already declined");
    }

    #[test]
    fn decline_by_signer_records_reason() {
        let owner = user("owner@example.com");
        let bob = user("bob@example.com");
        let (mut doc, fields) = pending(&owner, &[Some("Bob@example.com")]);

        let event = decline(&mut doc, &fields, Actor::User(&bob), Some("Wrong rent")).unwrap();
        assert_eq!(event.details, "Document declined. Reason: Wrong rent");
        assert_eq!(event.user_id, Some(bob.id));
    }

    #[test]
    fn decline_by_stranger_is_forbidden() {
        let owner = user("owner@example.com");
        let mallory = user("mallory@example.com");
        let (mut doc, fields) = pending(&owner, &[Some("bob@example.com")]);
        let err = decline(&mut doc, &fields, Actor::User(&mallory), None).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[test]
    fn completed_cannot_be_declined() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[None]);
        let field_id = fields[0].id;
        sign_field(&mut doc, &mut fields, field_id, Actor::Public, SIG).unwrap();
        assert_eq!(
            decline(&mut doc, &fields, Actor::Public, None).unwrap_err().to_string(),
            "Document is already completed"
        );
    }

    #[test]
    fn recall_resets_completed_document() {
        let owner = user("owner@example.com");
        let (mut doc, mut fields) = pending(&owner, &[Some("bob@example.com"), None]);
        let token = doc.signing_token.clone();
        let ids = fields.iter().map(|f| f.id).collect::<Vec<_>>();
        for id in &ids {
            sign_field(&mut doc, &mut fields, *id, Actor::Public, SIG).unwrap();
        }
        doc.signed_file_path = Some("signed_lease.pdf".to_string());
        assert_eq!(doc.status, DocumentStatus::Completed);

        let event = recall(&mut doc, &mut fields, &owner).unwrap();
        assert_eq!(event.details, "Document recalled to draft mode. Signatures cleared.");
        assert_eq!(doc.status, DocumentStatus::Draft);
        assert_eq!(doc.signed_file_path, None);
        assert_eq!(doc.signing_token, token);
        assert_eq!(fields.iter().map(|f| f.id).collect::<Vec<_>>(), ids);
        assert_eq!(fields[0].signer_email.as_deref(), Some("bob@example.com"));
        assert!(fields.iter().all(|f| f.status == FieldStatus::Pending && f.signature_data.is_none()));
    }

    #[test]
    fn recall_rules() {
        let owner = user("owner@example.com");
        let bob = user("bob@example.com");
        let (mut doc, mut fields) = pending(&owner, &[Some("bob@example.com")]);
        assert!(matches!(recall(&mut doc, &mut fields, &bob), Err(Error::Forbidden(_))));

        recall(&mut doc, &mut fields, &owner).unwrap();
        assert_eq!(
            recall(&mut doc, &mut fields, &owner).unwrap_err().to_string(),
            "Document is already draft"
        );
    }

    #[test]
    fn fields_only_editable_in_draft() {
        assert!(DocumentStatus::Draft.check_editable().is_ok());
        assert!(DocumentStatus::Pending.check_editable().is_err());
        assert!(DocumentStatus::Completed.check_editable().is_err());
    }

    #[test]
    fn access_covers_owner_and_signers() {
        let owner = user("owner@example.com");
        let bob = user("BOB@example.com");
        let mallory = user("mallory@example.com");
        let doc = document(&owner);
        let fields = vec![field(&doc, 1, Some("bob@example.com")), field(&doc, 2, Some(" "))];
        assert!(has_access(&doc, &fields, &owner));
        assert!(has_access(&doc, &fields, &bob));
        assert!(!has_access(&doc, &fields, &mallory));
    }

    #[test]
    fn upload_event_names_title() {
        let owner = user("owner@example.com");
        let event = AuditEvent::upload(&document(&owner));
        assert_eq!(event.action, AuditAction::Upload);
        assert_eq!(event.details, "Document 'Lease' uploaded");
        assert_eq!(event.user_id, Some(owner.id));
    }
}
