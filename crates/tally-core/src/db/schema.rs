//! Canonical SQLite schema for the ledger store.
//!
//! - `counters` holds one row per (tenant, scope, sequence name); it is only
//!   ever touched by the allocator's single-statement increment
//! - `documents` keeps the latest whole-document state with its LWW stamp
//! - `audit_snapshots` is append-only apart from the retention sweep
//! - `pending_writes` and `sync_conflicts` back offline reconciliation
//! - `store_meta` carries the schema version and the store-wide write sequence

/// Migration v1: counters, documents, audit snapshots, store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS counters (
    tenant_id TEXT NOT NULL CHECK (length(trim(tenant_id)) > 0),
    scope_id TEXT NOT NULL CHECK (length(trim(scope_id)) > 0),
    sequence_name TEXT NOT NULL CHECK (length(trim(sequence_name)) > 0),
    value INTEGER NOT NULL DEFAULT 0 CHECK (value >= 0),
    updated_at_us INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, scope_id, sequence_name)
);

CREATE TABLE IF NOT EXISTS documents (
    tenant_id TEXT NOT NULL,
    collection_path TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    parent_id TEXT,
    body_json TEXT NOT NULL,
    server_ts_us INTEGER NOT NULL,
    write_seq INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, collection_path, doc_id)
);

CREATE TABLE IF NOT EXISTS audit_snapshots (
    snapshot_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('CREATE', 'UPDATE', 'DELETE')),
    collection TEXT NOT NULL,
    collection_path TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    parent_id TEXT,
    ts_us INTEGER NOT NULL,
    write_seq INTEGER NOT NULL,
    author_json TEXT,
    before_json TEXT,
    after_json TEXT,
    expires_at_us INTEGER NOT NULL,
    CHECK (operation <> 'CREATE' OR before_json IS NULL),
    CHECK (operation <> 'DELETE' OR after_json IS NULL)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    write_seq INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version, write_seq) VALUES (1, 1, 0);
";

/// Migration v2: offline queue, idempotency ledger, sync conflicts.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS pending_writes (
    write_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    collection_path TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    op TEXT NOT NULL CHECK (op IN ('create', 'update', 'delete')),
    fields_json TEXT,
    base_version INTEGER,
    actor_json TEXT NOT NULL,
    queued_at_us INTEGER NOT NULL,
    queue_seq INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending'
        CHECK (state IN ('pending', 'synced', 'conflict', 'discarded'))
);

CREATE TABLE IF NOT EXISTS applied_writes (
    write_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    applied_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    conflict_id TEXT PRIMARY KEY,
    write_id TEXT NOT NULL UNIQUE REFERENCES pending_writes(write_id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    collection_path TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    category TEXT NOT NULL CHECK (category IN (
        'update_to_deleted_document', 'validation_rejected', 'permission_denied'
    )),
    detail TEXT,
    local_json TEXT NOT NULL,
    remote_json TEXT,
    detected_at_us INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'discarded', 'retried', 'recreated')),
    resolved_at_us INTEGER,
    recreated_doc_id TEXT
);
";

/// Migration v3: read-path indexes.
pub const MIGRATION_V3_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_documents_parent
    ON documents(tenant_id, parent_id);

CREATE INDEX IF NOT EXISTS idx_audit_tenant_ts
    ON audit_snapshots(tenant_id, ts_us DESC, write_seq DESC);

CREATE INDEX IF NOT EXISTS idx_audit_expiry
    ON audit_snapshots(expires_at_us, snapshot_id);

CREATE INDEX IF NOT EXISTS idx_pending_writes_queue
    ON pending_writes(state, queue_seq);

CREATE INDEX IF NOT EXISTS idx_sync_conflicts_tenant_status
    ON sync_conflicts(tenant_id, status, detected_at_us);
";

/// Migration v4: one outbox position per queued write.
pub const MIGRATION_V4_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_writes_seq
    ON pending_writes(queue_seq);
";

/// Indexes the read and write paths depend on.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_documents_parent",
    "idx_audit_tenant_ts",
    "idx_audit_expiry",
    "idx_pending_writes_queue",
    "idx_sync_conflicts_tenant_status",
    "idx_pending_writes_seq",
];
