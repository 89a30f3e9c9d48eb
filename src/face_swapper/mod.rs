pub mod emap;
pub mod face_swapper;
