/// Square model resolution used when a detector does not override it.
pub const DEFAULT_INPUT_SIZE: (u32, u32) = (640, 640);

/// Grey fill used for letterbox padding.
pub const LETTERBOX_COLOR: u8 = 114;
