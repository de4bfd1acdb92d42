//! Guest output decoding.
//!
//! A guest reports its response by writing a trailer line `<body>|<status>`
//! to stdout, terminated by a newline. Anything before the trailer is log
//! output.
//!
//! The rule is applied literally: split the whole stream on `\n` and take the
//! second-to-last segment. Without a final newline the trailer is therefore
//! the line *before* the last one, and a body containing `\n` or a leading
//! `|` cannot be represented. There is no escaping.

use edge_gateway_common::ProtocolError;

/// A decoded guest response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedOutput {
    /// Response body: the trailer text before the first `|`.
    pub body: Vec<u8>,
    /// HTTP status from the trailer.
    pub status_code: u16,
    /// Lines the guest printed before the trailer.
    pub log_lines: Vec<String>,
}

/// Decode raw guest stdout.
///
/// # Errors
///
/// Returns a [`ProtocolError`] when there is no terminated line, the trailer
/// has no `|`, or the status is not an integer in `100..=999`. No partial
/// result is produced.
pub fn decode(raw: &[u8]) -> Result<DecodedOutput, ProtocolError> {
    let segments: Vec<&[u8]> = raw.split(|b| *b == b'\n').collect();
    if segments.len() < 2 {
        return Err(ProtocolError::TooFewLines {
            lines: segments.len(),
        });
    }

    let trailer_index = segments.len() - 2;
    let trailer = strip_cr(segments[trailer_index]);

    let separator = trailer
        .iter()
        .position(|b| *b == b'|')
        .ok_or(ProtocolError::MissingSeparator)?;
    let (body, status) = (&trailer[..separator], &trailer[separator + 1..]);

    let status = parse_status(strip_cr(status))?;

    let log_lines = segments[..trailer_index]
        .iter()
        .map(|line| String::from_utf8_lossy(strip_cr(line)).into_owned())
        .collect();

    Ok(DecodedOutput {
        body: body.to_vec(),
        status_code: status,
        log_lines,
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_status(raw: &[u8]) -> Result<u16, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidStatus)?;
    let status: i64 = text.parse().map_err(|_| ProtocolError::InvalidStatus)?;

    if !(100..=999).contains(&status) {
        return Err(ProtocolError::StatusOutOfRange { status });
    }

    u16::try_from(status).map_err(|_| ProtocolError::StatusOutOfRange { status })
}
