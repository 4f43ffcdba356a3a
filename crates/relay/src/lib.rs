//! User-space relay for accepted flows.
//!
//! Java traffic is proxied as a byte stream, Bedrock traffic as
//! session-keyed datagrams. Every flow is admitted through the packet
//! classifier before a single byte reaches the hidden origin.

use util::glob_export;

glob_export!(bedrock);
glob_export!(flow);
glob_export!(java);
glob_export!(metrics);
glob_export!(supervisor);

#[cfg(test)]
mod test;
