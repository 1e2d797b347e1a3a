// Entity Models
//
// Reference data the engine normalizes against. Vendors are the only
// entity with free-text spellings that need canonicalizing.

pub mod vendor;

pub use vendor::{
    MatchThresholds, PatchRule, VendorCanonicalEntry, VendorCanonicalizer, VendorTable,
};
