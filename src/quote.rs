//! Fixed-layout TDX quote decoding.
//!
//! The layout is pinned to the DCAP ECDSA quote structure version 4 carrying
//! a TD report 1.0 body: a 48-byte header, a 584-byte report body, a 4-byte
//! signature-blob length and the signature blob itself. Scalars are
//! little-endian. Version 5 quotes (TD report 1.5) are rejected as
//! unsupported rather than parsed by guesswork.
//!
//! Decoding is purely computational: no I/O, no shared state, all-or-nothing.

use crate::error::{DecodeError, FieldMismatch};

/// Quote format version this decoder understands.
pub const QUOTE_VERSION: u16 = 4;
/// TEE type tag for TDX in the quote header.
pub const TEE_TYPE_TDX: u32 = 0x0000_0081;
/// Attestation key type tag for ECDSA-256-with-P-256.
pub const ATTESTATION_KEY_ECDSA_P256: u16 = 2;

pub const HEADER_SIZE: usize = 48;
pub const TD_REPORT_SIZE: usize = 584;
/// Offset of the `u32` signature-blob length field.
pub const SIG_LEN_OFFSET: usize = HEADER_SIZE + TD_REPORT_SIZE;
/// Smallest buffer that can hold a quote with an empty signature blob.
pub const MIN_QUOTE_SIZE: usize = SIG_LEN_OFFSET + 4;

/// TD report 1.0 body offsets, relative to the start of the body.
pub const TEE_TCB_SVN_OFFSET: usize = 0;
pub const MRSEAM_OFFSET: usize = TEE_TCB_SVN_OFFSET + 16;
pub const MRSIGNERSEAM_OFFSET: usize = MRSEAM_OFFSET + 48;
pub const SEAMATTRIBUTES_OFFSET: usize = MRSIGNERSEAM_OFFSET + 48;
pub const TDATTRIBUTES_OFFSET: usize = SEAMATTRIBUTES_OFFSET + 8;
pub const XFAM_OFFSET: usize = TDATTRIBUTES_OFFSET + 8;
pub const MRTD_OFFSET: usize = XFAM_OFFSET + 8;
pub const MRCONFIGID_OFFSET: usize = MRTD_OFFSET + 48;
pub const MROWNER_OFFSET: usize = MRCONFIGID_OFFSET + 48;
pub const MROWNERCONFIG_OFFSET: usize = MROWNER_OFFSET + 48;
pub const RTMR0_OFFSET: usize = MROWNERCONFIG_OFFSET + 48;
pub const RTMR1_OFFSET: usize = RTMR0_OFFSET + 48;
pub const RTMR2_OFFSET: usize = RTMR1_OFFSET + 48;
pub const RTMR3_OFFSET: usize = RTMR2_OFFSET + 48;
pub const REPORTDATA_OFFSET: usize = RTMR3_OFFSET + 48;

/// Decoded quote header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteHeader {
    pub version: u16,
    pub attestation_key_type: u16,
    pub tee_type: u32,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

/// Decoded TD report 1.0 body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdReport {
    pub tee_tcb_svn: [u8; 16],
    pub mr_seam: [u8; 48],
    pub mr_signer_seam: [u8; 48],
    pub seam_attributes: [u8; 8],
    pub td_attributes: [u8; 8],
    pub xfam: [u8; 8],
    pub mr_td: [u8; 48],
    pub mr_config_id: [u8; 48],
    pub mr_owner: [u8; 48],
    pub mr_owner_config: [u8; 48],
    pub rt_mr0: [u8; 48],
    pub rt_mr1: [u8; 48],
    pub rt_mr2: [u8; 48],
    pub rt_mr3: [u8; 48],
    pub report_data: [u8; 64],
}

impl TdReport {
    /// Runtime measurement register by index 0..=3.
    pub fn rtmr(&self, index: usize) -> Option<&[u8; 48]> {
        match index {
            0 => Some(&self.rt_mr0),
            1 => Some(&self.rt_mr1),
            2 => Some(&self.rt_mr2),
            3 => Some(&self.rt_mr3),
            _ => None,
        }
    }

    /// Sanity checks on decoded TD attributes.
    ///
    /// The DEBUG bit (bit 0 of `td_attributes`) must be clear and
    /// `mr_signer_seam` must be all zeroes for an Intel-signed TDX module.
    /// Violations are measurement-level findings, not decode failures.
    pub fn validate_td(&self) -> Vec<FieldMismatch> {
        let mut mismatches = Vec::new();
        if self.td_attributes[0] & 0x01 != 0 {
            mismatches.push(FieldMismatch::new(
                "td_attributes.debug",
                "0",
                "1",
            ));
        }
        if self.mr_signer_seam != [0u8; 48] {
            mismatches.push(FieldMismatch::new(
                "mr_signer_seam",
                hex::encode([0u8; 48]),
                hex::encode(self.mr_signer_seam),
            ));
        }
        mismatches
    }
}

/// A fully decoded attestation quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub header: QuoteHeader,
    pub report: TdReport,
    /// Opaque signature blob. Signature chain verification is out of scope
    /// here; the blob is retained so callers can hand it to a QVL.
    pub signature: Vec<u8>,
}

fn take<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    let slice = buf
        .get(offset..offset + N)
        .ok_or(DecodeError::Truncated {
            offset,
            need: N,
            len: buf.len(),
        })?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn take_u16(buf: &[u8], offset: usize) -> Result<u16, DecodeError> {
    take::<2>(buf, offset).map(u16::from_le_bytes)
}

fn take_u32(buf: &[u8], offset: usize) -> Result<u32, DecodeError> {
    take::<4>(buf, offset).map(u32::from_le_bytes)
}

impl Quote {
    /// Decode a raw quote blob.
    ///
    /// Validates the declared total length before reading past it. Any field
    /// whose slice would run past the buffer end yields
    /// [`DecodeError::Truncated`]; an unrecognized version, TEE type or
    /// attestation key type yields the corresponding unsupported-format
    /// error. No partial decode is ever returned.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let header = Self::decode_header(buf)?;
        let report = Self::decode_report(buf)?;

        let sig_len = take_u32(buf, SIG_LEN_OFFSET)? as usize;
        let total = MIN_QUOTE_SIZE + sig_len;
        if buf.len() < total {
            return Err(DecodeError::Truncated {
                offset: MIN_QUOTE_SIZE,
                need: sig_len,
                len: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(DecodeError::TrailingData {
                expected: total,
                actual: buf.len(),
            });
        }
        let signature = buf[MIN_QUOTE_SIZE..total].to_vec();

        Ok(Quote {
            header,
            report,
            signature,
        })
    }

    fn decode_header(buf: &[u8]) -> Result<QuoteHeader, DecodeError> {
        let version = take_u16(buf, 0)?;
        if version != QUOTE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let attestation_key_type = take_u16(buf, 2)?;
        if attestation_key_type != ATTESTATION_KEY_ECDSA_P256 {
            return Err(DecodeError::UnsupportedAttestationKey(attestation_key_type));
        }
        let tee_type = take_u32(buf, 4)?;
        if tee_type != TEE_TYPE_TDX {
            return Err(DecodeError::UnsupportedTeeType(tee_type));
        }
        Ok(QuoteHeader {
            version,
            attestation_key_type,
            tee_type,
            qe_vendor_id: take(buf, 12)?,
            user_data: take(buf, 28)?,
        })
    }

    fn decode_report(buf: &[u8]) -> Result<TdReport, DecodeError> {
        let body = HEADER_SIZE;
        Ok(TdReport {
            tee_tcb_svn: take(buf, body + TEE_TCB_SVN_OFFSET)?,
            mr_seam: take(buf, body + MRSEAM_OFFSET)?,
            mr_signer_seam: take(buf, body + MRSIGNERSEAM_OFFSET)?,
            seam_attributes: take(buf, body + SEAMATTRIBUTES_OFFSET)?,
            td_attributes: take(buf, body + TDATTRIBUTES_OFFSET)?,
            xfam: take(buf, body + XFAM_OFFSET)?,
            mr_td: take(buf, body + MRTD_OFFSET)?,
            mr_config_id: take(buf, body + MRCONFIGID_OFFSET)?,
            mr_owner: take(buf, body + MROWNER_OFFSET)?,
            mr_owner_config: take(buf, body + MROWNERCONFIG_OFFSET)?,
            rt_mr0: take(buf, body + RTMR0_OFFSET)?,
            rt_mr1: take(buf, body + RTMR1_OFFSET)?,
            rt_mr2: take(buf, body + RTMR2_OFFSET)?,
            rt_mr3: take(buf, body + RTMR3_OFFSET)?,
            report_data: take(buf, body + REPORTDATA_OFFSET)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Assemble a syntactically valid v4/TD10 quote from a report body.
    pub fn encode_quote(report: &TdReport) -> Vec<u8> {
        let mut buf = vec![0u8; MIN_QUOTE_SIZE];
        buf[0..2].copy_from_slice(&QUOTE_VERSION.to_le_bytes());
        buf[2..4].copy_from_slice(&ATTESTATION_KEY_ECDSA_P256.to_le_bytes());
        buf[4..8].copy_from_slice(&TEE_TYPE_TDX.to_le_bytes());

        let body = HEADER_SIZE;
        buf[body + TEE_TCB_SVN_OFFSET..body + MRSEAM_OFFSET]
            .copy_from_slice(&report.tee_tcb_svn);
        buf[body + MRSEAM_OFFSET..body + MRSIGNERSEAM_OFFSET].copy_from_slice(&report.mr_seam);
        buf[body + MRSIGNERSEAM_OFFSET..body + SEAMATTRIBUTES_OFFSET]
            .copy_from_slice(&report.mr_signer_seam);
        buf[body + SEAMATTRIBUTES_OFFSET..body + TDATTRIBUTES_OFFSET]
            .copy_from_slice(&report.seam_attributes);
        buf[body + TDATTRIBUTES_OFFSET..body + XFAM_OFFSET]
            .copy_from_slice(&report.td_attributes);
        buf[body + XFAM_OFFSET..body + MRTD_OFFSET].copy_from_slice(&report.xfam);
        buf[body + MRTD_OFFSET..body + MRCONFIGID_OFFSET].copy_from_slice(&report.mr_td);
        buf[body + MRCONFIGID_OFFSET..body + MROWNER_OFFSET]
            .copy_from_slice(&report.mr_config_id);
        buf[body + MROWNER_OFFSET..body + MROWNERCONFIG_OFFSET]
            .copy_from_slice(&report.mr_owner);
        buf[body + MROWNERCONFIG_OFFSET..body + RTMR0_OFFSET]
            .copy_from_slice(&report.mr_owner_config);
        buf[body + RTMR0_OFFSET..body + RTMR1_OFFSET].copy_from_slice(&report.rt_mr0);
        buf[body + RTMR1_OFFSET..body + RTMR2_OFFSET].copy_from_slice(&report.rt_mr1);
        buf[body + RTMR2_OFFSET..body + RTMR3_OFFSET].copy_from_slice(&report.rt_mr2);
        buf[body + RTMR3_OFFSET..body + REPORTDATA_OFFSET].copy_from_slice(&report.rt_mr3);
        buf[body + REPORTDATA_OFFSET..body + REPORTDATA_OFFSET + 64]
            .copy_from_slice(&report.report_data);
        // sig_len is already zero
        buf
    }

    pub fn zero_report() -> TdReport {
        TdReport {
            tee_tcb_svn: [0; 16],
            mr_seam: [0; 48],
            mr_signer_seam: [0; 48],
            seam_attributes: [0; 8],
            td_attributes: [0; 8],
            xfam: [0; 8],
            mr_td: [0; 48],
            mr_config_id: [0; 48],
            mr_owner: [0; 48],
            mr_owner_config: [0; 48],
            rt_mr0: [0; 48],
            rt_mr1: [0; 48],
            rt_mr2: [0; 48],
            rt_mr3: [0; 48],
            report_data: [0; 64],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{encode_quote, zero_report};
    use super::*;

    #[test]
    fn test_roundtrip_decode() {
        let mut report = zero_report();
        report.mr_td = [0xaa; 48];
        report.rt_mr2 = [0x33; 48];
        report.report_data[..4].copy_from_slice(b"abcd");

        let buf = encode_quote(&report);
        let quote = Quote::decode(&buf).unwrap();

        assert_eq!(quote.header.version, QUOTE_VERSION);
        assert_eq!(quote.header.tee_type, TEE_TYPE_TDX);
        assert_eq!(quote.report, report);
        assert!(quote.signature.is_empty());
    }

    #[test]
    fn test_truncated_buffers_never_panic() {
        let buf = encode_quote(&zero_report());
        for len in 0..buf.len() {
            let err = Quote::decode(&buf[..len]).unwrap_err();
            assert!(
                matches!(err, DecodeError::Truncated { .. }),
                "len {len} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut buf = encode_quote(&zero_report());
        buf[0..2].copy_from_slice(&5u16.to_le_bytes());
        assert_eq!(
            Quote::decode(&buf).unwrap_err(),
            DecodeError::UnsupportedVersion(5)
        );
    }

    #[test]
    fn test_non_tdx_tee_type_rejected() {
        let mut buf = encode_quote(&zero_report());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes()); // SGX
        assert_eq!(
            Quote::decode(&buf).unwrap_err(),
            DecodeError::UnsupportedTeeType(0)
        );
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut buf = encode_quote(&zero_report());
        buf.push(0);
        assert!(matches!(
            Quote::decode(&buf).unwrap_err(),
            DecodeError::TrailingData { .. }
        ));
    }

    #[test]
    fn test_signature_blob_length_honoured() {
        let mut buf = encode_quote(&zero_report());
        buf[SIG_LEN_OFFSET..SIG_LEN_OFFSET + 4].copy_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&[7u8; 8]);
        let quote = Quote::decode(&buf).unwrap();
        assert_eq!(quote.signature, vec![7u8; 8]);

        // Declared longer than provided: truncated, not partial.
        buf.pop();
        assert!(matches!(
            Quote::decode(&buf).unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn test_validate_td_flags_debug_and_seam_signer() {
        let mut report = zero_report();
        assert!(report.validate_td().is_empty());

        report.td_attributes[0] = 0x01;
        report.mr_signer_seam = [1; 48];
        let mismatches = report.validate_td();
        assert_eq!(mismatches.len(), 2);
        assert_eq!(mismatches[0].field, "td_attributes.debug");
        assert_eq!(mismatches[1].field, "mr_signer_seam");
    }
}
