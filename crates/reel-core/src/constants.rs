//! Tag keys and well-known values shared by the storage model and the services.

/// Tag carried by a derived rendition; the value is the canonical version id.
pub const MASTER_TAG: &str = "master";

/// Classification tag distinguishing the canonical rendition from derived ones.
pub const CONTEXT_TYPE_TAG: &str = "context_type";
pub const CONTEXT_TYPE_MASTER: &str = "master";
pub const CONTEXT_TYPE_SUBFORMAT: &str = "subformat";

/// Quality preset a derived rendition was transcoded with (e.g. "720p").
pub const PRESET_QUALITY_TAG: &str = "preset_quality";

/// Frame height of a rendition, in pixels.
pub const HEIGHT_TAG: &str = "height";

pub const DEFAULT_TRANSCODE_QUALITIES: &str = "360p,480p,720p,1080p,2160p";
