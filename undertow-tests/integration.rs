//! Integration tests for Undertow
//!
//! Drive the public content API end to end against the simulated swarm:
//! opening, deduplication, blocking reads, cancellation, priorities and
//! teardown.

#[path = "integration/fixtures.rs"]
mod fixtures;

#[path = "integration/async_reads.rs"]
mod async_reads;
#[path = "integration/cancellation.rs"]
mod cancellation;
#[path = "integration/locators.rs"]
mod locators;
#[path = "integration/priority_merge.rs"]
mod priority_merge;
#[path = "integration/read_contract.rs"]
mod read_contract;
#[path = "integration/registry_lifecycle.rs"]
mod registry_lifecycle;
