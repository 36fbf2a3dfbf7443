//! Metric names and registration.

use metrics::{describe_counter, Unit};

/// Rows pushed through the fetch CSV pipe, labelled by table.
pub const FETCH_ROWS_IMPORTED: &str = "molt_fetch_rows_imported";

/// Inconsistencies published by verify, labelled by table and kind.
pub const VERIFY_MISMATCHES: &str = "molt_verify_mismatches";

/// Rows scanned by verify, labelled by table.
pub const VERIFY_ROWS_READ: &str = "molt_verify_rows_read";

/// Describe all metrics with the installed recorder. Call once at startup,
/// after the exporter is installed.
pub fn register() {
    describe_counter!(
        FETCH_ROWS_IMPORTED,
        Unit::Count,
        "Number of rows that have been imported in"
    );
    describe_counter!(
        VERIFY_MISMATCHES,
        Unit::Count,
        "Number of row inconsistencies found during verification"
    );
    describe_counter!(
        VERIFY_ROWS_READ,
        Unit::Count,
        "Number of source rows scanned during verification"
    );
}
