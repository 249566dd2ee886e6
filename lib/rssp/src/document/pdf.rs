//! PDF adapter
//!
//! Appends an incremental update holding a signature dictionary, an
//! invisible signature field and a revised catalog. Parsing and writing go
//! through `lopdf`; only `/ByteRange` is patched in the serialized update,
//! once the placeholder position is known.

use chrono::Utc;
use lopdf::{Dictionary, Document, IncrementalDocument, Object, ObjectId, StringFormat};

use super::{DocumentAdapter, ModificationPermission, PreparedDocument};
use crate::error::RsspError;

const DEFAULT_SIGNATURE_CAPACITY: usize = 8192;
/// Written into `/ByteRange` so the array is wide enough for the real offsets.
const BYTE_RANGE_PLACEHOLDER: i64 = 9_999_999_999;

fn unsupported(reason: impl std::fmt::Display) -> RsspError {
    RsspError::InvalidRequest(format!("Unsupported PDF: {}", reason))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> lopdf::Result<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id),
        other => Ok(other),
    }
}

fn catalog_id(document: &Document) -> lopdf::Result<ObjectId> {
    document.trailer.get(b"Root")?.as_reference()
}

/// `/P` of the DocMDP certification signature, if the document has one.
fn docmdp_value(document: &Document) -> lopdf::Result<Option<i64>> {
    let catalog = document.get_object(catalog_id(document)?)?.as_dict()?;
    let Ok(perms) = catalog.get(b"Perms") else {
        return Ok(None);
    };
    let perms = resolve(document, perms)?.as_dict()?;
    let Ok(signature) = perms.get(b"DocMDP") else {
        return Ok(None);
    };
    let signature = resolve(document, signature)?.as_dict()?;

    let references: &[Object] = match signature.get(b"Reference") {
        Ok(references) => resolve(document, references)?.as_array()?.as_slice(),
        Err(_) => &[],
    };
    for reference in references {
        let reference = resolve(document, reference)?.as_dict()?;
        let docmdp = reference
            .get(b"TransformMethod")
            .and_then(Object::as_name)
            .is_ok_and(|method| method == b"DocMDP");
        if !docmdp {
            continue;
        }
        let value = reference
            .get(b"TransformParams")
            .and_then(|params| resolve(document, params))
            .and_then(Object::as_dict)
            .and_then(|params| params.get(b"P"))
            .and_then(Object::as_i64);
        return Ok(Some(value.unwrap_or(2)));
    }
    // A certification signature without /P defaults to 2.
    Ok(Some(2))
}

/// Add `field` to `/Fields` of an AcroForm dictionary and set `/SigFlags 3`.
fn add_signature_field(
    update: &mut IncrementalDocument,
    form: &mut Dictionary,
    field: ObjectId,
) -> lopdf::Result<()> {
    match form.get(b"Fields").ok().cloned() {
        Some(Object::Reference(fields)) => {
            let mut array = update.get_prev_documents().get_object(fields)?.as_array()?.clone();
            array.push(Object::Reference(field));
            update.new_document.set_object(fields, Object::Array(array));
        }
        Some(Object::Array(mut array)) => {
            array.push(Object::Reference(field));
            form.set("Fields", Object::Array(array));
        }
        _ => form.set("Fields", Object::Array(vec![Object::Reference(field)])),
    }
    if !form.has(b"SigFlags") {
        form.set("SigFlags", Object::Integer(3));
    }
    Ok(())
}

pub struct PdfAdapter {
    signature_capacity: usize,
    name: Option<String>,
    reason: Option<String>,
}

impl Default for PdfAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfAdapter {
    pub fn new() -> Self {
        Self {
            signature_capacity: DEFAULT_SIGNATURE_CAPACITY,
            name: None,
            reason: None,
        }
    }

    /// Bytes reserved for the signature value.
    pub fn with_signature_capacity(mut self, bytes: usize) -> Self {
        self.signature_capacity = bytes;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn signature_dictionary(&self) -> Dictionary {
        let mut signature = Dictionary::new();
        signature.set("Type", Object::Name(b"Sig".to_vec()));
        signature.set("Filter", Object::Name(b"Adobe.PPKLite".to_vec()));
        signature.set("SubFilter", Object::Name(b"adbe.pkcs7.detached".to_vec()));
        signature.set(
            "ByteRange",
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(BYTE_RANGE_PLACEHOLDER),
                Object::Integer(BYTE_RANGE_PLACEHOLDER),
                Object::Integer(BYTE_RANGE_PLACEHOLDER),
            ]),
        );
        signature.set(
            "Contents",
            Object::String(vec![0; self.signature_capacity], StringFormat::Hexadecimal),
        );
        signature.set(
            "M",
            Object::string_literal(format!("D:{}", Utc::now().format("%Y%m%d%H%M%SZ"))),
        );
        if let Some(name) = &self.name {
            signature.set("Name", Object::string_literal(name.as_str()));
        }
        if let Some(reason) = &self.reason {
            signature.set("Reason", Object::string_literal(reason.as_str()));
        }
        signature
    }

    /// Serialize `document` followed by the signature update.
    fn append_update(&self, document: &[u8]) -> lopdf::Result<Vec<u8>> {
        let mut update = IncrementalDocument::load_from(document)?;
        let (root, mut catalog) = {
            let previous = update.get_prev_documents();
            let root = catalog_id(previous)?;
            (root, previous.get_object(root)?.as_dict()?.clone())
        };

        let signature = update
            .new_document
            .add_object(Object::Dictionary(self.signature_dictionary()));

        let mut widget = Dictionary::new();
        widget.set("Type", Object::Name(b"Annot".to_vec()));
        widget.set("Subtype", Object::Name(b"Widget".to_vec()));
        widget.set("FT", Object::Name(b"Sig".to_vec()));
        widget.set("T", Object::string_literal(format!("Signature{}", signature.0)));
        widget.set("V", Object::Reference(signature));
        widget.set("F", Object::Integer(132));
        widget.set("Rect", Object::Array(vec![Object::Integer(0); 4]));
        let field = update.new_document.add_object(Object::Dictionary(widget));

        match catalog.get(b"AcroForm").cloned() {
            Ok(Object::Reference(form_id)) => {
                let mut form = update
                    .get_prev_documents()
                    .get_object(form_id)?
                    .as_dict()?
                    .clone();
                add_signature_field(&mut update, &mut form, field)?;
                update.new_document.set_object(form_id, Object::Dictionary(form));
            }
            Ok(Object::Dictionary(mut form)) => {
                add_signature_field(&mut update, &mut form, field)?;
                catalog.set("AcroForm", Object::Dictionary(form));
            }
            _ => {
                let mut form = Dictionary::new();
                add_signature_field(&mut update, &mut form, field)?;
                catalog.set("AcroForm", Object::Dictionary(form));
            }
        }
        update.new_document.set_object(root, Object::Dictionary(catalog));

        let mut output = Vec::with_capacity(document.len() + self.signature_capacity * 2 + 1024);
        update.save_to(&mut output)?;
        Ok(output)
    }
}

impl DocumentAdapter for PdfAdapter {
    fn modification_permission(&self, document: &[u8]) -> Result<ModificationPermission, RsspError> {
        let document = Document::load_mem(document).map_err(unsupported)?;
        Ok(ModificationPermission::from_value(
            docmdp_value(&document).map_err(unsupported)?,
        ))
    }

    fn reserve_placeholder(&self, document: &[u8]) -> Result<PreparedDocument, RsspError> {
        let mut output = self.append_update(document).map_err(unsupported)?;

        let contents_start = find(&output, b"/Contents", document.len())
            .and_then(|key| find(&output, b"<", key))
            .ok_or_else(|| unsupported("signature placeholder missing"))?;
        let contents_end = contents_start + self.signature_capacity * 2 + 2;
        let zero_filled = output
            .get(contents_start + 1..contents_end - 1)
            .is_some_and(|hex| hex.iter().all(|digit| *digit == b'0'));
        if !zero_filled || output.get(contents_end - 1) != Some(&b'>') {
            return Err(unsupported("signature placeholder damaged"));
        }

        let range_open = find(&output, b"/ByteRange", document.len())
            .and_then(|key| find(&output, b"[", key))
            .ok_or_else(|| unsupported("byte range placeholder missing"))?;
        let range_close = find(&output, b"]", range_open)
            .ok_or_else(|| unsupported("byte range placeholder missing"))?;
        let byte_range = format!(
            "[0 {} {} {}",
            contents_start,
            contents_end,
            output.len() - contents_end
        );
        let width = range_close - range_open;
        if byte_range.len() > width {
            return Err(unsupported("byte range does not fit its placeholder"));
        }
        output[range_open..range_close]
            .copy_from_slice(format!("{:<width$}", byte_range).as_bytes());

        PreparedDocument::new(output, contents_start..contents_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ContentSigner, sign_document};
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build_pdf(objects: &[&str]) -> Vec<u8> {
        let mut out = b"%PDF-1.7\n".to_vec();
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
        }
        let xref = out.len();
        out.extend_from_slice(
            format!("xref\n0 {}\n0000000000 65535 f\r\n", objects.len() + 1).as_bytes(),
        );
        for offset in offsets {
            out.extend_from_slice(format!("{:010} 00000 n\r\n", offset).as_bytes());
        }
        out.extend_from_slice(
            format!(
                "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                objects.len() + 1,
                xref
            )
            .as_bytes(),
        );
        out
    }

    const PAGES: &str = "<< /Type /Pages /Kids [3 0 R] /Count 1 >>";
    const PAGE: &str = "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>";

    fn minimal_pdf() -> Vec<u8> {
        build_pdf(&["<< /Type /Catalog /Pages 2 0 R >>", PAGES, PAGE])
    }

    fn certified_pdf(p: i64) -> Vec<u8> {
        let signature = format!(
            "<< /Type /Sig /Reference [<< /Type /SigRef /TransformMethod /DocMDP /TransformParams << /Type /TransformParams /P {} /V /1.2 >> >>] >>",
            p
        );
        build_pdf(&[
            "<< /Type /Catalog /Pages 2 0 R /Perms << /DocMDP 4 0 R >> >>",
            PAGES,
            PAGE,
            &signature,
        ])
    }

    struct CountingSigner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentSigner for CountingSigner {
        async fn sign_content(&self, content: &mut (dyn Read + Send)) -> Result<Vec<u8>, RsspError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut buffer = Vec::new();
            content.read_to_end(&mut buffer)?;
            Ok(Sha256::digest(&buffer).to_vec())
        }
    }

    fn acro_form_fields(document: &Document) -> Vec<ObjectId> {
        let catalog = document
            .get_object(catalog_id(document).unwrap())
            .unwrap()
            .as_dict()
            .unwrap();
        let form = resolve(document, catalog.get(b"AcroForm").unwrap())
            .unwrap()
            .as_dict()
            .unwrap();
        assert_eq!(form.get(b"SigFlags").unwrap().as_i64().unwrap(), 3);
        resolve(document, form.get(b"Fields").unwrap())
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|field| field.as_reference().unwrap())
            .collect()
    }

    #[test]
    fn test_permission_without_certification() {
        let adapter = PdfAdapter::new();
        assert_eq!(
            adapter.modification_permission(&minimal_pdf()).unwrap(),
            ModificationPermission::Unrestricted
        );
    }

    #[test]
    fn test_permission_from_docmdp() {
        let adapter = PdfAdapter::new();
        assert_eq!(
            adapter.modification_permission(&certified_pdf(1)).unwrap(),
            ModificationPermission::NoChanges
        );
        assert_eq!(
            adapter.modification_permission(&certified_pdf(3)).unwrap(),
            ModificationPermission::Annotations
        );
        assert_eq!(
            adapter.modification_permission(&certified_pdf(7)).unwrap(),
            ModificationPermission::FormFilling
        );
    }

    #[test]
    fn test_reserve_builds_consistent_update() {
        let original = minimal_pdf();
        let prepared = PdfAdapter::new()
            .with_signature_capacity(64)
            .with_reason("Approval (final)")
            .reserve_placeholder(&original)
            .unwrap();
        let bytes = prepared.as_bytes();

        assert!(bytes.starts_with(&original));
        let [start, first_len, second_start, second_len] = prepared.byte_range();
        assert_eq!(start, 0);
        assert_eq!(bytes[first_len], b'<');
        assert_eq!(bytes[second_start - 1], b'>');
        assert_eq!(second_start + second_len, bytes.len());
        assert_eq!(prepared.capacity(), 64);

        let reloaded = Document::load_mem(bytes).unwrap();
        let fields = acro_form_fields(&reloaded);
        assert_eq!(fields.len(), 1);

        let widget = reloaded.get_object(fields[0]).unwrap().as_dict().unwrap();
        assert_eq!(widget.get(b"FT").unwrap().as_name().unwrap(), b"Sig");
        let signature_id = widget.get(b"V").unwrap().as_reference().unwrap();
        let signature = reloaded.get_object(signature_id).unwrap().as_dict().unwrap();

        let range: Vec<i64> = signature
            .get(b"ByteRange")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_i64().unwrap())
            .collect();
        assert_eq!(
            range,
            [start, first_len, second_start, second_len].map(|v| v as i64)
        );
        assert_eq!(
            signature.get(b"SubFilter").unwrap().as_name().unwrap(),
            b"adbe.pkcs7.detached"
        );
        assert_eq!(
            signature.get(b"Reason").unwrap().as_str().unwrap(),
            b"Approval (final)"
        );

        // Untouched objects still resolve through /Prev.
        let page = reloaded.get_object((3, 0)).unwrap().as_dict().unwrap();
        assert_eq!(page.get(b"Type").unwrap().as_name().unwrap(), b"Page");
    }

    #[test]
    fn test_existing_acro_form_keeps_fields() {
        let pdf = build_pdf(&[
            "<< /Type /Catalog /Pages 2 0 R /AcroForm 4 0 R >>",
            PAGES,
            PAGE,
            "<< /Fields [5 0 R] >>",
            "<< /FT /Tx /T (name) >>",
        ]);
        let prepared = PdfAdapter::new().reserve_placeholder(&pdf).unwrap();

        let reloaded = Document::load_mem(prepared.as_bytes()).unwrap();
        let fields = acro_form_fields(&reloaded);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], (5, 0));
    }

    #[test]
    fn test_not_a_pdf_rejected() {
        let adapter = PdfAdapter::new();
        assert!(matches!(
            adapter.reserve_placeholder(b"plain text, no header"),
            Err(RsspError::InvalidRequest(_))
        ));
        assert!(matches!(
            adapter.modification_permission(b""),
            Err(RsspError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_document_signs_everything_but_placeholder() {
        let signer = CountingSigner {
            calls: AtomicUsize::new(0),
        };
        let adapter = PdfAdapter::new().with_signature_capacity(64);
        let signed = sign_document(&adapter, &signer, &minimal_pdf()).await.unwrap();

        let contents_start = find(&signed, b"/Contents", minimal_pdf().len())
            .and_then(|key| find(&signed, b"<", key))
            .unwrap();
        let contents_end = contents_start + 64 * 2 + 2;
        let mut covered = signed[..contents_start].to_vec();
        covered.extend_from_slice(&signed[contents_end..]);
        let digest = hex::encode_upper(Sha256::digest(&covered));

        let contents = String::from_utf8_lossy(&signed[contents_start + 1..contents_end - 1]);
        assert!(contents.starts_with(&digest));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_signature_chains_updates() {
        let signer = CountingSigner {
            calls: AtomicUsize::new(0),
        };
        let adapter = PdfAdapter::new().with_signature_capacity(64);
        let once = sign_document(&adapter, &signer, &minimal_pdf()).await.unwrap();
        let twice = sign_document(&adapter, &signer, &once).await.unwrap();

        assert!(twice.starts_with(&once));
        let reloaded = Document::load_mem(&twice).unwrap();
        assert_eq!(acro_form_fields(&reloaded).len(), 2);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_changes_permission_fails_fast() {
        let signer = CountingSigner {
            calls: AtomicUsize::new(0),
        };
        let result = sign_document(&PdfAdapter::new(), &signer, &certified_pdf(1)).await;
        assert!(matches!(result, Err(RsspError::ModificationNotPermitted)));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }
}
