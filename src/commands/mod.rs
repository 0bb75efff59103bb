pub mod evaluate;
pub mod judge;
pub mod merge;
pub mod scores;
pub mod status;
