use crate::client::{QuiverClient, QuiverCollection};
use crate::error::guard;
use crate::marshal::{
    check_out, embedding, embedding_rows, float_array, free_array, free_string_array_raw, handle, metadata_array,
    opt_json, opt_str_array, str_array, string_array, write_out,
};
use quiver_core::{
    ErrorCode, GetRequest, Include, QueryRequest, QueryResult, RecordBatch, RecordFilter, Result,
};
use std::ffi::{c_char, c_int, c_uint};
use std::ptr;

/// Parallel result arrays. Arrays for fields that were not requested are
/// null with a zero count. `embeddings` is `embeddings_count` rows of
/// `embedding_dim` floats laid out contiguously.
#[repr(C)]
pub struct QuiverQueryResult {
    pub ids: *mut *mut c_char,
    pub ids_count: usize,
    pub distances: *mut f32,
    pub distances_count: usize,
    pub embeddings: *mut f32,
    pub embeddings_count: usize,
    pub embedding_dim: usize,
    pub metadata_json: *mut *mut c_char,
    pub metadata_count: usize,
    pub documents: *mut *mut c_char,
    pub documents_count: usize,
}

impl QuiverQueryResult {
    fn empty() -> Self {
        Self {
            ids: ptr::null_mut(),
            ids_count: 0,
            distances: ptr::null_mut(),
            distances_count: 0,
            embeddings: ptr::null_mut(),
            embeddings_count: 0,
            embedding_dim: 0,
            metadata_json: ptr::null_mut(),
            metadata_count: 0,
            documents: ptr::null_mut(),
            documents_count: 0,
        }
    }

    /// Release every array; safe on partially filled results
    unsafe fn release(&mut self) {
        free_string_array_raw(self.ids, self.ids_count);
        free_array(self.distances, self.distances_count);
        free_array(self.embeddings, self.embeddings_count * self.embedding_dim);
        free_string_array_raw(self.metadata_json, self.metadata_count);
        free_string_array_raw(self.documents, self.documents_count);
        *self = Self::empty();
    }

    fn from_result(result: QueryResult) -> Result<Self> {
        let mut out = Self::empty();
        if let Err(e) = out.fill(result) {
            unsafe { out.release() };
            return Err(e);
        }
        Ok(out)
    }

    fn fill(&mut self, result: QueryResult) -> Result<()> {
        let n = result.ids.len();
        self.ids = string_array(result.ids.iter().map(Some), n)?;
        self.ids_count = n;

        if let Some(distances) = result.distances {
            let len = distances.len();
            self.distances = float_array(distances, len)?;
            self.distances_count = len;
        }
        if let Some(embeddings) = result.embeddings {
            let dim = embeddings.first().map(|v| v.dim()).unwrap_or(0);
            let len = embeddings.len() * dim;
            self.embeddings = float_array(embeddings.iter().flat_map(|v| v.as_slice().iter().copied()), len)?;
            self.embeddings_count = if dim == 0 { 0 } else { embeddings.len() };
            self.embedding_dim = dim;
        }
        if let Some(metadatas) = result.metadatas {
            let json: Vec<Option<String>> = metadatas
                .iter()
                .map(|m| m.as_ref().map(serde_json::to_string).transpose())
                .collect::<std::result::Result<_, _>>()?;
            self.metadata_json = string_array(json, n)?;
            self.metadata_count = n;
        }
        if let Some(documents) = result.documents {
            self.documents = string_array(documents, n)?;
            self.documents_count = n;
        }
        Ok(())
    }
}

fn include(embeddings: c_int, metadatas: c_int, documents: c_int, distances: c_int) -> Include {
    Include {
        embeddings: embeddings != 0,
        metadatas: metadatas != 0,
        documents: documents != 0,
        distances: distances != 0,
    }
}

fn write_result(result: QueryResult, out: *mut *mut QuiverQueryResult) -> Result<()> {
    let converted = Box::into_raw(Box::new(QuiverQueryResult::from_result(result)?));
    unsafe { write_out(out, converted) }
}

#[allow(clippy::too_many_arguments)]
unsafe fn read_batch(
    ids: *const *const c_char,
    ids_count: usize,
    embeddings: *const *const f32,
    embedding_dim: usize,
    embeddings_required: bool,
    metadatas_json: *const *const c_char,
    documents: *const *const c_char,
) -> Result<RecordBatch> {
    let ids = str_array(ids, ids_count, "ids")?;
    let mut batch = RecordBatch::for_ids(ids);
    if !embeddings.is_null() || embeddings_required {
        batch = batch.with_embeddings(embedding_rows(embeddings, ids_count, embedding_dim)?);
    }
    batch.metadatas = metadata_array(metadatas_json, ids_count)?;
    batch.documents = opt_str_array(documents, ids_count, "documents")?;
    Ok(batch)
}

unsafe fn read_filter(where_json: *const c_char, where_document_json: *const c_char) -> Result<Option<RecordFilter>> {
    RecordFilter::parse(opt_json(where_json, "where")?, opt_json(where_document_json, "where_document")?)
}

/// Add records. `embeddings` holds `ids_count` row pointers of
/// `embedding_dim` floats; `metadatas_json` and `documents` may be null,
/// as may any of their entries. An existing id is replaced.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_add(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    ids: *const *const c_char,
    ids_count: usize,
    embeddings: *const *const f32,
    embedding_dim: usize,
    metadatas_json: *const *const c_char,
    documents: *const *const c_char,
) -> c_int {
    guard("add", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        let batch = read_batch(ids, ids_count, embeddings, embedding_dim, true, metadatas_json, documents)?;
        client.inner.add(&collection.inner, batch)
    })
}

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_upsert(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    ids: *const *const c_char,
    ids_count: usize,
    embeddings: *const *const f32,
    embedding_dim: usize,
    metadatas_json: *const *const c_char,
    documents: *const *const c_char,
) -> c_int {
    guard("upsert", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        let batch = read_batch(ids, ids_count, embeddings, embedding_dim, true, metadatas_json, documents)?;
        client.inner.upsert(&collection.inner, batch)
    })
}

/// Partially update existing records. Null `embeddings`, `metadatas_json`
/// or `documents` leave that field untouched; a JSON null metadata value
/// removes the key. `updated` receives the number of records touched.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_update(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    ids: *const *const c_char,
    ids_count: usize,
    embeddings: *const *const f32,
    embedding_dim: usize,
    metadatas_json: *const *const c_char,
    documents: *const *const c_char,
    updated: *mut usize,
) -> c_int {
    guard("update", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        check_out(updated)?;
        let batch = read_batch(ids, ids_count, embeddings, embedding_dim, false, metadatas_json, documents)?;
        write_out(updated, client.inner.update(&collection.inner, batch)?)
    })
}

/// Delete by ids (null `ids` means "no id selector"), by filter, or both
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_delete(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    ids: *const *const c_char,
    ids_count: usize,
    where_filter_json: *const c_char,
    where_document_filter: *const c_char,
    deleted: *mut usize,
) -> c_int {
    guard("delete", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        check_out(deleted)?;
        let ids = if ids.is_null() {
            None
        } else {
            Some(str_array(ids, ids_count, "ids")?)
        };
        let filter = read_filter(where_filter_json, where_document_filter)?;
        let count = client
            .inner
            .delete(&collection.inner, ids.as_deref(), filter.as_ref())?;
        write_out(deleted, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_count(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    result: *mut usize,
) -> c_int {
    guard("count", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        write_out(result, client.inner.count(&collection.inner)?)
    })
}

/// Nearest neighbours of one query embedding
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_query(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    query_embedding: *const f32,
    embedding_dim: usize,
    n_results: c_uint,
    where_filter_json: *const c_char,
    where_document_filter: *const c_char,
    include_embeddings: c_int,
    include_metadatas: c_int,
    include_documents: c_int,
    include_distances: c_int,
    result: *mut *mut QuiverQueryResult,
) -> c_int {
    guard("query", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        check_out(result)?;
        let request = QueryRequest::new(embedding(query_embedding, embedding_dim)?, n_results as usize)
            .with_filter(read_filter(where_filter_json, where_document_filter)?)
            .with_include(include(
                include_embeddings,
                include_metadatas,
                include_documents,
                include_distances,
            ));
        write_result(client.inner.query(&collection.inner, &request)?, result)
    })
}

/// List records by ids and/or filter in insertion order. `limit` 0 means
/// no limit. Distances are never populated.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn quiver_get(
    client_handle: *mut QuiverClient,
    collection_handle: *const QuiverCollection,
    ids: *const *const c_char,
    ids_count: usize,
    where_filter_json: *const c_char,
    where_document_filter: *const c_char,
    limit: usize,
    offset: usize,
    include_embeddings: c_int,
    include_metadatas: c_int,
    include_documents: c_int,
    result: *mut *mut QuiverQueryResult,
) -> c_int {
    guard("get", || {
        let client = handle(client_handle, "client")?;
        let collection = handle(collection_handle, "collection")?;
        check_out(result)?;
        let request = GetRequest {
            ids: if ids.is_null() {
                None
            } else {
                Some(str_array(ids, ids_count, "ids")?)
            },
            filter: read_filter(where_filter_json, where_document_filter)?,
            limit: (limit > 0).then_some(limit),
            offset,
            include: include(include_embeddings, include_metadatas, include_documents, 0),
        };
        write_result(client.inner.get(&collection.inner, &request)?, result)
    })
}

#[no_mangle]
pub unsafe extern "C" fn quiver_free_query_result(result: *mut QuiverQueryResult) -> c_int {
    if result.is_null() {
        return ErrorCode::Success as c_int;
    }
    let mut boxed = Box::from_raw(result);
    boxed.release();
    ErrorCode::Success as c_int
}
