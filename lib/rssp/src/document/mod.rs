//! External signing protocol
//!
//! A format adapter reserves a fixed-size signature placeholder in the
//! document. Everything outside the placeholder is the signable content,
//! which goes to a [`ContentSigner`]; the returned signature is spliced back
//! into the placeholder. Any failure aborts the whole run and no partial
//! document is produced.

mod container;
mod pdf;

pub use container::DetachedSignature;
pub use pdf::PdfAdapter;

use std::io::{Cursor, Read};
use std::ops::Range;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::RsspError;

/// DocMDP access permission (`/P` of the transform parameters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationPermission {
    /// No certification signature present.
    Unrestricted,
    /// `/P 1`: no changes at all, including further signatures.
    NoChanges,
    /// `/P 2`: form filling and signing.
    FormFilling,
    /// `/P 3`: form filling, signing and annotations.
    Annotations,
}

impl ModificationPermission {
    /// Map a raw `/P` value. Absent means unrestricted; anything outside
    /// 1..=3 is read as the PDF default of 2.
    pub fn from_value(value: Option<i64>) -> Self {
        match value {
            None | Some(0) => Self::Unrestricted,
            Some(1) => Self::NoChanges,
            Some(3) => Self::Annotations,
            Some(_) => Self::FormFilling,
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Self::Unrestricted => 0,
            Self::NoChanges => 1,
            Self::FormFilling => 2,
            Self::Annotations => 3,
        }
    }

    pub fn allows_signing(&self) -> bool {
        !matches!(self, Self::NoChanges)
    }
}

/// A document with a reserved, zero-filled signature placeholder.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    bytes: Vec<u8>,
    /// `<...>` of the placeholder, delimiters included
    contents: Range<usize>,
}

impl PreparedDocument {
    /// `contents` must cover a hex string `<...>` inside `bytes`.
    pub fn new(bytes: Vec<u8>, contents: Range<usize>) -> Result<Self, RsspError> {
        let valid = contents.end <= bytes.len()
            && contents.end >= contents.start + 2
            && bytes[contents.start] == b'<'
            && bytes[contents.end - 1] == b'>';
        if !valid {
            return Err(RsspError::InvalidRequest(
                "Signature placeholder is not a hex string".to_string(),
            ));
        }
        Ok(Self { bytes, contents })
    }

    /// `[offset1, length1, offset2, length2]` of the signed ranges.
    pub fn byte_range(&self) -> [usize; 4] {
        [
            0,
            self.contents.start,
            self.contents.end,
            self.bytes.len() - self.contents.end,
        ]
    }

    /// Largest signature, in bytes, the placeholder can hold.
    pub fn capacity(&self) -> usize {
        (self.contents.len() - 2) / 2
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Everything except the placeholder, in document order.
    pub fn signable_content(&self) -> impl Read + Send + '_ {
        Cursor::new(&self.bytes[..self.contents.start])
            .chain(Cursor::new(&self.bytes[self.contents.end..]))
    }

    /// Write `signature` into the placeholder as hex, zero-padded.
    pub fn splice(mut self, signature: &[u8]) -> Result<Vec<u8>, RsspError> {
        if signature.is_empty() {
            return Err(RsspError::FailedSigningData("Empty signature".to_string()));
        }
        if signature.len() > self.capacity() {
            return Err(RsspError::InvalidRequest(format!(
                "Signature of {} bytes does not fit a {} byte placeholder",
                signature.len(),
                self.capacity()
            )));
        }
        let encoded = hex::encode_upper(signature);
        let start = self.contents.start + 1;
        self.bytes[start..start + encoded.len()].copy_from_slice(encoded.as_bytes());
        Ok(self.bytes)
    }
}

/// Format-specific half of the protocol.
pub trait DocumentAdapter: Send + Sync {
    fn modification_permission(&self, document: &[u8]) -> Result<ModificationPermission, RsspError>;

    fn reserve_placeholder(&self, document: &[u8]) -> Result<PreparedDocument, RsspError>;
}

/// Produces a detached signature over a content stream.
#[async_trait]
pub trait ContentSigner: Send + Sync {
    async fn sign_content(&self, content: &mut (dyn Read + Send)) -> Result<Vec<u8>, RsspError>;
}

/// Run the external signing protocol over `document`.
pub async fn sign_document(
    adapter: &dyn DocumentAdapter,
    signer: &dyn ContentSigner,
    document: &[u8],
) -> Result<Vec<u8>, RsspError> {
    let permission = adapter.modification_permission(document)?;
    if !permission.allows_signing() {
        return Err(RsspError::ModificationNotPermitted);
    }

    let prepared = adapter.reserve_placeholder(document)?;
    debug!(byte_range = ?prepared.byte_range(), "Reserved signature placeholder");

    let signature = {
        let mut content = prepared.signable_content();
        signer.sign_content(&mut content).await?
    };

    let signed = prepared.splice(&signature)?;
    info!(
        size = signed.len(),
        signature_len = signature.len(),
        "Signed document"
    );
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared() -> PreparedDocument {
        let bytes = b"head<000000>tail".to_vec();
        PreparedDocument::new(bytes, 4..12).unwrap()
    }

    #[test]
    fn test_permission_mapping() {
        assert_eq!(ModificationPermission::from_value(None), ModificationPermission::Unrestricted);
        assert_eq!(ModificationPermission::from_value(Some(1)), ModificationPermission::NoChanges);
        assert_eq!(ModificationPermission::from_value(Some(3)), ModificationPermission::Annotations);
        assert_eq!(ModificationPermission::from_value(Some(9)), ModificationPermission::FormFilling);
        assert!(!ModificationPermission::NoChanges.allows_signing());
        assert!(ModificationPermission::FormFilling.allows_signing());
    }

    #[test]
    fn test_signable_content_skips_placeholder() {
        let document = prepared();
        assert_eq!(document.byte_range(), [0, 4, 12, 4]);
        let mut content = Vec::new();
        document.signable_content().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"headtail");
    }

    #[test]
    fn test_splice_pads_with_zeros() {
        let signed = prepared().splice(&[0xab]).unwrap();
        assert_eq!(signed, b"head<AB0000>tail");
    }

    #[test]
    fn test_splice_rejects_oversized_signature() {
        assert!(matches!(
            prepared().splice(&[1, 2, 3, 4]),
            Err(RsspError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_placeholder_must_be_hex_string() {
        assert!(PreparedDocument::new(b"abc".to_vec(), 0..3).is_err());
        assert!(PreparedDocument::new(b"<>".to_vec(), 0..4).is_err());
    }
}
