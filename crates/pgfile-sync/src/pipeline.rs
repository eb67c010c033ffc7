//! Two-stage query execution and interpretation of its positional results.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use pgfile_core::{
    BatchResults, DesiredFileState, FileId, FileStateSource, Session, SyncError, SyncResult,
};

/// Run the authorize/fetch batch for `file_id` and interpret it.
///
/// `Ok(None)` means the row vanished between notification and fetch.
///
/// # Errors
///
/// Returns `Transport` when the batch cannot be executed, `Authorization`
/// when the session is not affirmed, and `InvalidRow` for unusable rows.
pub async fn execute(
    source: Arc<dyn FileStateSource>,
    session: Session,
    file_id: FileId,
) -> SyncResult<Option<DesiredFileState>> {
    let batch = source.fetch_file_state(&session, &file_id).await?;
    interpret(batch)
}

/// Interpret batch results: statement 0 must affirm, statement 1 yields at most one row.
///
/// # Errors
///
/// Returns `Authorization` carrying the upstream message when statement 0
/// does not affirm the session, or `InvalidRow` when the fetched row is unusable.
pub fn interpret(batch: BatchResults) -> SyncResult<Option<DesiredFileState>> {
    let BatchResults { authorize, file } = batch;
    match authorize.into_iter().next() {
        Some(row) if row.authorized => {}
        Some(row) => {
            return Err(SyncError::Authorization {
                message: row.message.unwrap_or_default(),
            });
        }
        None => {
            return Err(SyncError::Authorization {
                message: "authorization returned no rows".to_string(),
            });
        }
    }

    file.into_iter()
        .next()
        .map(DesiredFileState::try_from)
        .transpose()
}

/// Decode a base64 payload, ignoring embedded whitespace and line breaks.
///
/// # Errors
///
/// Returns `Decode` when the payload is not valid base64.
pub fn decode_payload(data: &str) -> SyncResult<Vec<u8>> {
    let squeezed: String = data.chars().filter(|ch| !ch.is_whitespace()).collect();
    Ok(STANDARD.decode(squeezed)?)
}
