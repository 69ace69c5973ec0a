use crate::config::MigrationHash;
use quiver_core::{Error, Result};
use sha2::{Digest, Sha256};

/// Describes the on-disk layout. Any change to table names or value
/// encodings must change this string so stale stores are detected.
pub const SCHEMA: &str = "quiver-lmdb/1 \
    meta:str->bytes \
    databases:tenant\\0name->json(Database) \
    collections:uuid->json(Collection) \
    records:uuid:id->json(RecordMeta) \
    vectors:uuid:id->bincode(seq:u64,data:[f32])";

pub fn schema_checksum(hash: MigrationHash) -> Result<String> {
    match hash {
        MigrationHash::Sha256 => Ok(format!("{:x}", Sha256::digest(SCHEMA.as_bytes()))),
        MigrationHash::Md5 => Err(Error::NotImplemented(
            "md5 migration hashes are not supported".to_string(),
        )),
    }
}
