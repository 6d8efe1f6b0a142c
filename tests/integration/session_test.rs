//! Integration tests for session orchestration.
//!
//! These tests are implemented in:
//! `crates/dbox-runtime/tests/session_test.rs`
//!
//! Covered scenarios:
//! - `first_run_creates_starts_and_executes`: Fresh workdir, create, start, exec, output relayed
//! - `second_run_reuses_container_and_returns_status`: No second create, exit status passed through
//! - `container_deleted_outside_the_tool_is_recreated`: Missing container detected and recreated
//! - `missing_subordinate_ranges_fail_without_engine_calls`: Identity failure before any engine call
//! - `mount_collision_is_rejected_before_engine_calls`: Mount validation before create
//! - `concurrent_runs_create_exactly_one_container`: Lock serializes lifecycle changes
//! - `stale_lock_of_dead_process_is_reclaimed`: Dead lock holder recovered
//! - `transient_failures_below_limit_are_retried`: Backoff retries for a busy engine
//! - `missing_image_fails_once_without_retry`: Fatal engine errors are not retried
//! - `remove_twice_is_a_no_op`: Removal is idempotent
