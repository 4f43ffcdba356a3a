//! The control plane: configuration, the durable desired-state store, the
//! map synchronizer, the edge-node fleet manager and the operator API.

use util::glob_export;

glob_export!(api);
glob_export!(config);
glob_export!(fleet);
glob_export!(push);
glob_export!(store);
glob_export!(sync);
