pub mod config;
pub mod panic;
pub mod parallel;

use uuid::{ NoContext, Timestamp, Uuid };

/// Generate UUIDv7 (for boundaries, draft IDs, etc.)
pub fn uuid7() -> String {
    let ts = Timestamp::now(NoContext);
    Uuid::new_v7(ts).to_string()
}

/// Generate IMAP UIDVALIDITY from UUIDv7 timestamp
/// RFC 3501 compliant: non-zero, stable, 32-bit
pub fn generate_uidvalidity() -> u32 {
    let ts = Timestamp::now(NoContext);

    // IMAP servers usually use seconds
    let secs = ts.to_unix().0;
    u32::try_from(secs).unwrap_or(u32::MAX).max(1)
}
