use itertools::Itertools;
use log::{error, info, warn};
use crate::{models, pdf, CompositeMode, FieldID};

#[derive(Debug, Clone)]
pub struct Compositor {
    files_dir: std::path::PathBuf,
    mode: CompositeMode,
}

#[derive(Debug)]
pub struct Flattened {
    pub bytes: Vec<u8>,
    pub embedded: usize,
    pub skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("signature payload is not a base64 data URI")]
    DataUri,
    #[error("invalid base64 in signature payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{0}")]
    Pdf(#[from] pdf::Error),
    #[error("field has no signature")]
    Unsigned,
}

#[derive(Debug, thiserror::Error)]
enum CompositeError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Pdf(#[from] pdf::Error),
}

/// Extracts the bytes from a `data:<mime>;base64,<content>` payload.
pub fn decode_data_uri(payload: &str) -> Result<Vec<u8>, FieldError> {
    let (meta, content) = match payload.trim().strip_prefix("data:").and_then(|p| p.split_once(',')) {
        Some(p) => p,
        None => return Err(FieldError::DataUri)
    };
    if !meta.split(';').any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(FieldError::DataUri);
    }

    Ok(base64::decode(content.trim())?)
}

pub fn signed_file_name(file_path: &str) -> String {
    let name = std::path::Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string());
    format!("signed_{}", name)
}

fn embed_field(page: &mut pdf::DocumentPage, field: &models::SignatureField, page_width: f64) -> Result<(), FieldError> {
    let payload = match field.signature_data.as_deref() {
        Some(p) => p,
        None => return Err(FieldError::Unsigned)
    };
    let img = decode_data_uri(payload)?;
    page.add_png(&img, &field.page_rect(page_width))?;
    Ok(())
}

/// Draws every signed field's image onto its page. Fields that can't be
/// embedded are logged and skipped; only document-level failures are errors.
pub fn flatten(original: &[u8], fields: &[models::SignatureField]) -> Result<Flattened, pdf::Error> {
    let mut doc = pdf::Document::load_mem(original)?;
    let mut embedded = 0;
    let mut skipped = 0;

    let fields_by_page = fields.iter()
        .filter(|f| f.is_signed())
        .sorted_by_key(|f| f.page_number)
        .group_by(|f| f.page_number);

    for (page_number, page_fields) in &fields_by_page {
        let page_fields = page_fields.collect::<Vec<_>>();
        let page = match u32::try_from(page_number) {
            Ok(n) => doc.page(n),
            Err(_) => Err(pdf::Error::Syntax(format!("invalid page number {}", page_number))),
        };
        let page = match page {
            Ok(p) => p,
            Err(err) => {
                warn!("Skipping {} field(s) on page {}: {}", page_fields.len(), page_number, err);
                skipped += page_fields.len();
                continue;
            }
        };

        let (page_embedded, page_skipped) = page.setup(|page| {
            let page_width = page.width();
            let mut ok = 0;
            let mut failed = 0;
            for field in &page_fields {
                match embed_field(page, field, page_width) {
                    Ok(()) => ok += 1,
                    Err(err) => {
                        warn!("Skipping field {}: {}", FieldID::new(field.id), err);
                        failed += 1;
                    }
                }
            }
            (ok, failed)
        })?;
        embedded += page_embedded;
        skipped += page_skipped;
    }

    Ok(Flattened {
        bytes: doc.finalise()?,
        embedded,
        skipped,
    })
}

impl Compositor {
    pub fn new(files_dir: std::path::PathBuf, mode: CompositeMode) -> Self {
        Self {
            files_dir,
            mode,
        }
    }

    pub fn files_dir(&self) -> &std::path::Path {
        &self.files_dir
    }

    /// Produces the signed artifact for a fully signed document, returning its
    /// path relative to the files directory. Failures are logged, never returned.
    pub async fn composite(&self, document: &models::Document, fields: Vec<models::SignatureField>) -> Option<String> {
        let document_id = crate::DocumentID::new(document.id);

        if !fields.iter().all(models::SignatureField::is_signed) {
            warn!("Not compositing {}: unsigned fields remain", document_id);
            return None;
        }

        if self.mode == CompositeMode::Passthrough {
            info!("Recording original file as signed artifact for {}", document_id);
            return Some(document.file_path.clone());
        }

        let signed_name = signed_file_name(&document.file_path);
        let source = self.files_dir.join(&document.file_path);
        let dest = self.files_dir.join(&signed_name);

        let res = tokio::task::spawn_blocking(move || -> Result<Flattened, CompositeError> {
            let original = std::fs::read(&source)?;
            let flattened = flatten(&original, &fields)?;
            std::fs::write(&dest, &flattened.bytes)?;
            Ok(flattened)
        }).await;

        match res {
            Ok(Ok(flattened)) => {
                info!(
                    "Composited {} signature(s) into {} for {} ({} skipped)",
                    flattened.embedded, signed_name, document_id, flattened.skipped
                );
                Some(signed_name)
            }
            Ok(Err(err)) => {
                error!("Unable to composite signatures for {}: {}", document_id, err);
                None
            }
            Err(err) => {
                error!("Compositing task for {} failed: {}", document_id, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{blank_pdf, drawn_xobjects, gray_png, oversized_png, page_contents, rgba_png};
    use crate::schema::FieldStatus;
    use crate::signing::fixtures::{document, field, user};

    fn data_uri(png: &[u8]) -> String {
        format!("data:image/png;base64,{}", base64::encode(png))
    }

    fn signed(mut f: models::SignatureField, payload: &str) -> models::SignatureField {
        f.status = FieldStatus::Signed;
        f.signature_data = Some(payload.to_string());
        f
    }

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("docsign-test-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn decodes_data_uris() {
        assert_eq!(decode_data_uri("data:image/png;base64,aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_data_uri(" data:;base64,aGVsbG8= ").unwrap(), b"hello");
        assert!(matches!(decode_data_uri("aGVsbG8="), Err(FieldError::DataUri)));
        assert!(matches!(decode_data_uri("data:image/png,hello"), Err(FieldError::DataUri)));
        assert!(matches!(decode_data_uri("data:image/png;base64,!!!"), Err(FieldError::Base64(_))));
    }

    #[test]
    fn signed_name_uses_file_name() {
        assert_eq!(signed_file_name("abc.pdf"), "signed_abc.pdf");
        assert_eq!(signed_file_name("nested/abc.pdf"), "signed_abc.pdf");
    }

    #[test]
    fn embeds_valid_fields_and_skips_broken_ones() {
        let owner = user("owner@example.com");
        let doc = document(&owner);
        let good = data_uri(&rgba_png(8, 4));
        let fields = vec![
            signed(field(&doc, 1, None), &good),
            signed(field(&doc, 2, None), &data_uri(&gray_png(4, 4))),
            signed(field(&doc, 1, None), "not a data uri"),
            signed(field(&doc, 2, None), "data:image/png;base64,@@@@"),
            signed(field(&doc, 2, None), &format!("data:image/gif;base64,{}", base64::encode(b"GIF89a"))),
            signed(field(&doc, 5, None), &good),
        ];

        let flattened = flatten(&blank_pdf(2, 612, 792), &fields).unwrap();
        assert_eq!(flattened.embedded, 2);
        assert_eq!(flattened.skipped, 4);
        assert_eq!(drawn_xobjects(&flattened.bytes, 1).len(), 1);
        assert_eq!(drawn_xobjects(&flattened.bytes, 2).len(), 1);
    }

    #[test]
    fn image_with_huge_declared_size_is_skipped() {
        let owner = user("owner@example.com");
        let doc = document(&owner);
        let fields = vec![
            signed(field(&doc, 1, None), &data_uri(&oversized_png(60000, 60000))),
            signed(field(&doc, 2, None), &data_uri(&rgba_png(2, 2))),
        ];

        let original = blank_pdf(2, 612, 792);
        let flattened = flatten(&original, &fields).unwrap();
        assert_eq!(flattened.embedded, 1);
        assert_eq!(flattened.skipped, 1);
        assert_eq!(page_contents(&flattened.bytes, 1), page_contents(&original, 1));
        assert_eq!(drawn_xobjects(&flattened.bytes, 2).len(), 1);
    }

    #[test]
    fn unsigned_fields_are_not_drawn() {
        let owner = user("owner@example.com");
        let doc = document(&owner);
        let fields = vec![field(&doc, 1, None)];
        let flattened = flatten(&blank_pdf(1, 612, 792), &fields).unwrap();
        assert_eq!(flattened.embedded, 0);
        assert!(drawn_xobjects(&flattened.bytes, 1).is_empty());
    }

    #[test]
    fn unparsable_pdf_fails_whole_document() {
        assert!(flatten(b"%PDF-1.5 garbage", &[]).is_err());
    }

    #[tokio::test]
    async fn writes_signed_copy() {
        let dir = scratch_dir();
        let owner = user("owner@example.com");
        let mut doc = document(&owner);
        doc.file_path = "lease.pdf".to_string();
        std::fs::write(dir.join("lease.pdf"), blank_pdf(1, 612, 792)).unwrap();
        let fields = vec![signed(field(&doc, 1, None), &data_uri(&rgba_png(2, 2)))];

        let compositor = Compositor::new(dir.clone(), CompositeMode::Flatten);
        let signed_path = compositor.composite(&doc, fields).await;
        assert_eq!(signed_path.as_deref(), Some("signed_lease.pdf"));

        let bytes = std::fs::read(dir.join("signed_lease.pdf")).unwrap();
        assert_eq!(drawn_xobjects(&bytes, 1).len(), 1);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn incomplete_or_missing_input_produces_nothing() {
        let dir = scratch_dir();
        let owner = user("owner@example.com");
        let doc = document(&owner);
        let compositor = Compositor::new(dir.clone(), CompositeMode::Flatten);

        assert_eq!(compositor.composite(&doc, vec![field(&doc, 1, None)]).await, None);

        let fields = vec![signed(field(&doc, 1, None), &data_uri(&rgba_png(2, 2)))];
        assert_eq!(compositor.composite(&doc, fields).await, None);
        assert!(!dir.join(signed_file_name(&doc.file_path)).exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn passthrough_records_original() {
        let owner = user("owner@example.com");
        let doc = document(&owner);
        let fields = vec![signed(field(&doc, 1, None), "data:image/png;base64,AAAA")];
        let compositor = Compositor::new(std::env::temp_dir(), CompositeMode::Passthrough);
        assert_eq!(compositor.composite(&doc, fields).await, Some(doc.file_path.clone()));
    }
}
