//! Image-analysis layers of the tracker, from raw frames to tracking records.

pub mod assignment;
pub mod background;
pub mod body;
pub mod eyes;
pub mod frame;
pub mod geometry;
pub mod localizer;
pub mod overlay;
pub mod records;
pub mod tail;
pub mod tracker;
