//! The per-packet classifier.
//!
//! One bounded, non-blocking, allocation-free decision per ingress packet:
//! drop, pass to the host stack, or redirect to the flow relay. Errors never
//! propagate out of this crate; every anomaly is a verdict plus a counter.

use util::glob_export;

glob_export!(bedrock);
glob_export!(challenge);
glob_export!(classifier);
glob_export!(java);
glob_export!(packet);

#[cfg(test)]
mod test_support;
