// SQL query constants for repositories
// Shared SELECT column lists, one per table

/// Columns of the repository_bindings table
pub mod binding_queries {
    pub const SELECT_ALL_COLUMNS: &str =
        "id, owner, name, branch, status, last_synced_at, created_at";
}

/// Columns of the repository_files table, with JSON defaults for NULLs
pub mod file_queries {
    pub const SELECT_ALL_COLUMNS: &str = r#"id, binding_id, path, branch, content_hash, script_id,
        risk_level, requires_elevation,
        COALESCE(findings, '[]'::jsonb) as findings,
        COALESCE(parse_warnings, '[]'::jsonb) as parse_warnings,
        last_modified_at"#;
}

/// Columns of the scripts table, with JSON defaults for NULLs
pub mod script_queries {
    pub const SELECT_ALL_COLUMNS: &str = r#"id, name, description, version, content, content_hash,
        COALESCE(tags, '[]'::jsonb) as tags,
        is_active, timeout_seconds, min_runtime_version, risk_level, requires_elevation,
        COALESCE(parameters, '[]'::jsonb) as parameters,
        COALESCE(dependencies, '[]'::jsonb) as dependencies,
        binding_id, source_path, created_at, updated_at"#;
}

/// Columns of the sync_records table
pub mod sync_queries {
    pub const SELECT_ALL_COLUMNS: &str = r#"id, binding_id, kind, outcome,
        files_added, files_updated, files_removed, files_failed,
        commit_sha, duration_ms, error, started_at, completed_at"#;
}

/// Columns of the script_executions table
pub mod execution_queries {
    pub const SELECT_ALL_COLUMNS: &str = r#"id, script_id, script_version, ad_hoc_content, status,
        COALESCE(parameters, '{}'::jsonb) as parameters,
        timeout_seconds, constrained_mode, memory_limit_mb,
        output, error_output, exit_code, error,
        host_name, runtime_version, requested_by,
        created_at, started_at, completed_at"#;
}
