pub mod sequence;
pub mod track;
