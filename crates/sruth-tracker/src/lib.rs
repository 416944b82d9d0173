//! Wire-level types and codec shared between a `TrackerProxy` client and
//! any tracker implementation. No matchmaking/admission policy lives here
//! (spec.md §1 scopes that out) -- only the bytes on the wire.

mod wire;

pub use wire::{
    decode_offline_report, encode_offline_report, read_request, read_response, write_request,
    write_response, Filter, FilterServerMap, TrackerRequest, TrackerResponse, WireError,
    MAX_FRAME_BYTES,
};
