use crate::error::guard;
use crate::marshal::{
    check_out, free_string_array_raw, handle, opt_json, opt_str, parse_metadata, req_str, string_array, to_c_string,
    write_out,
};
use quiver_core::{Collection, CollectionConfig, ErrorCode};
use quiver_storage::{Client, ClientConfig, MigrationHash, MigrationMode, StorageConfig};
use std::ffi::{c_char, c_int};
use std::path::PathBuf;

/// Opaque client handle
pub struct QuiverClient {
    pub(crate) inner: Client,
}

/// Opaque collection handle. Holds the catalog entry it was opened with;
/// operations re-read the live entry, so a stale handle is safe.
pub struct QuiverCollection {
    pub(crate) inner: Collection,
}

/// Persistence selectors passed at client construction
#[repr(C)]
pub struct QuiverStorageConfig {
    /// LMDB directory, `:memory:`, or null to derive it from `persist_path`
    pub url: *const c_char,
    /// 0 = sha256, 1 = md5
    pub hash_type: c_int,
    /// 0 = apply, 1 = validate
    pub migration_mode: c_int,
}

/// Names returned by listing calls
#[repr(C)]
pub struct QuiverResultSet {
    pub ids: *mut *mut c_char,
    pub count: usize,
}

fn collection_out(collection: Collection, out: *mut *mut QuiverCollection) -> quiver_core::Result<()> {
    let boxed = Box::into_raw(Box::new(QuiverCollection { inner: collection }));
    unsafe { write_out(out, boxed) }
}

#[no_mangle]
pub unsafe extern "C" fn quiver_create_client(
    allow_reset: c_int,
    storage_config: *const QuiverStorageConfig,
    hnsw_cache_size: usize,
    persist_path: *const c_char,
    client_handle: *mut *mut QuiverClient,
) -> c_int {
    guard("create_client", || {
        check_out(client_handle)?;
        let storage = match storage_config.as_ref() {
            Some(cfg) => StorageConfig {
                url: opt_json(cfg.url, "url")?.map(str::to_string),
                hash: MigrationHash::from_code(cfg.hash_type)?,
                migration_mode: MigrationMode::from_code(cfg.migration_mode)?,
                map_size: None,
            },
            None => StorageConfig::default(),
        };
        let config = ClientConfig {
            allow_reset: allow_reset != 0,
            storage,
            hnsw_cache_size,
            persist_path: opt_json(persist_path, "persist_path")?.map(PathBuf::from),
            ..ClientConfig::default()
        };
        let client = Client::new(config)?;
        write_out(client_handle, Box::into_raw(Box::new(QuiverClient { inner: client })))
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_destroy_client(client_handle: *mut QuiverClient) -> c_int {
    if client_handle.is_null() {
        return ErrorCode::InvalidArgument as c_int;
    }
    guard("destroy_client", || {
        drop(Box::from_raw(client_handle));
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_heartbeat(client_handle: *mut QuiverClient, result: *mut u64) -> c_int {
    guard("heartbeat", || {
        let client = handle(client_handle, "client")?;
        write_out(result, client.inner.heartbeat()?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_reset(client_handle: *mut QuiverClient) -> c_int {
    guard("reset", || handle(client_handle, "client")?.inner.reset())
}

#[no_mangle]
pub unsafe extern "C" fn quiver_create_database(
    client_handle: *mut QuiverClient,
    name: *const c_char,
    tenant: *const c_char,
) -> c_int {
    guard("create_database", || {
        let client = handle(client_handle, "client")?;
        client
            .inner
            .create_database(req_str(name, "name")?, req_str(tenant, "tenant")?)?;
        Ok(())
    })
}

/// Writes the database id as a newly allocated string
#[no_mangle]
pub unsafe extern "C" fn quiver_get_database(
    client_handle: *mut QuiverClient,
    name: *const c_char,
    tenant: *const c_char,
    id_result: *mut *mut c_char,
) -> c_int {
    guard("get_database", || {
        let client = handle(client_handle, "client")?;
        check_out(id_result)?;
        let database = client
            .inner
            .get_database(req_str(name, "name")?, req_str(tenant, "tenant")?)?;
        write_out(id_result, to_c_string(&database.id.to_string())?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_delete_database(
    client_handle: *mut QuiverClient,
    name: *const c_char,
    tenant: *const c_char,
) -> c_int {
    guard("delete_database", || {
        let client = handle(client_handle, "client")?;
        client
            .inner
            .delete_database(req_str(name, "name")?, req_str(tenant, "tenant")?)
    })
}

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_create_collection(
    client_handle: *mut QuiverClient,
    name: *const c_char,
    config_json: *const c_char,
    metadata_json: *const c_char,
    get_or_create: c_int,
    tenant: *const c_char,
    database: *const c_char,
    collection_handle: *mut *mut QuiverCollection,
) -> c_int {
    guard("create_collection", || {
        let client = handle(client_handle, "client")?;
        check_out(collection_handle)?;
        let metadata = opt_json(metadata_json, "metadata_json")?
            .map(parse_metadata)
            .transpose()?;
        let config = CollectionConfig::resolve(opt_json(config_json, "config_json")?, metadata.as_ref())?;
        let collection = client.inner.create_collection(
            req_str(name, "name")?,
            Some(config),
            metadata,
            get_or_create != 0,
            req_str(tenant, "tenant")?,
            req_str(database, "database")?,
        )?;
        collection_out(collection, collection_handle)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_get_collection(
    client_handle: *mut QuiverClient,
    name: *const c_char,
    tenant: *const c_char,
    database: *const c_char,
    collection_handle: *mut *mut QuiverCollection,
) -> c_int {
    guard("get_collection", || {
        let client = handle(client_handle, "client")?;
        check_out(collection_handle)?;
        let collection = client.inner.get_collection(
            req_str(name, "name")?,
            req_str(tenant, "tenant")?,
            req_str(database, "database")?,
        )?;
        collection_out(collection, collection_handle)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_get_collection_by_id(
    client_handle: *mut QuiverClient,
    collection_id: *const c_char,
    collection_handle: *mut *mut QuiverCollection,
) -> c_int {
    guard("get_collection_by_id", || {
        let client = handle(client_handle, "client")?;
        check_out(collection_handle)?;
        let collection = client
            .inner
            .get_collection_by_id(req_str(collection_id, "collection_id")?)?;
        collection_out(collection, collection_handle)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_delete_collection(
    client_handle: *mut QuiverClient,
    name: *const c_char,
    tenant: *const c_char,
    database: *const c_char,
) -> c_int {
    guard("delete_collection", || {
        let client = handle(client_handle, "client")?;
        client.inner.delete_collection(
            req_str(name, "name")?,
            req_str(tenant, "tenant")?,
            req_str(database, "database")?,
        )
    })
}

/// Collection names in a database, sorted
#[no_mangle]
pub unsafe extern "C" fn quiver_list_collections(
    client_handle: *mut QuiverClient,
    tenant: *const c_char,
    database: *const c_char,
    result: *mut *mut QuiverResultSet,
) -> c_int {
    guard("list_collections", || {
        let client = handle(client_handle, "client")?;
        check_out(result)?;
        let collections = client
            .inner
            .list_collections(req_str(tenant, "tenant")?, req_str(database, "database")?)?;
        let count = collections.len();
        let ids = string_array(collections.into_iter().map(|c| Some(c.name)), count)?;
        write_out(result, Box::into_raw(Box::new(QuiverResultSet { ids, count })))
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_free_result_set(result: *mut QuiverResultSet) -> c_int {
    if !result.is_null() {
        let set = Box::from_raw(result);
        free_string_array_raw(set.ids, set.count);
    }
    ErrorCode::Success as c_int
}

/// Writes the collection's UUID as a newly allocated string
#[no_mangle]
pub unsafe extern "C" fn quiver_collection_id(
    collection_handle: *const QuiverCollection,
    id_result: *mut *mut c_char,
) -> c_int {
    guard("collection_id", || {
        let collection = handle(collection_handle, "collection")?;
        write_out(id_result, to_c_string(&collection.inner.id.to_string())?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_destroy_collection(collection_handle: *mut QuiverCollection) -> c_int {
    if collection_handle.is_null() {
        return ErrorCode::InvalidArgument as c_int;
    }
    drop(Box::from_raw(collection_handle));
    ErrorCode::Success as c_int
}

/// Install a global `tracing` subscriber filtered by `level` (an
/// `EnvFilter` directive such as `info` or `quiver_core=debug`). Null
/// falls back to `RUST_LOG`, then `info`. Later calls are no-ops.
#[no_mangle]
pub unsafe extern "C" fn quiver_init_logging(level: *const c_char) -> c_int {
    use tracing_subscriber::EnvFilter;

    guard("init_logging", || {
        let filter = match opt_str(level, "level")? {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| quiver_core::Error::InvalidArgument(format!("invalid log filter: {}", e)))?,
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        // a subscriber may already be installed by the host; keep it
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        Ok(())
    })
}
