//! Shared data-plane tables.
//!
//! The packet classifier reads these tables on every ingress packet and the
//! map synchronizer writes them on behalf of the control plane. All tables
//! are fixed-capacity and keyed; mutations are per-key, there is no global
//! lock anywhere in this crate.

use util::glob_export;

glob_export!(blacklist);
glob_export!(bucket);
glob_export!(challenge);
glob_export!(conntrack);
glob_export!(endpoint);
glob_export!(event);
glob_export!(stats);
glob_export!(table);
