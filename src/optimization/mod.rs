//! Optimization passes: loop vectorization, control-flow shaping and flag
//! cleanup.

pub mod controlflow;
pub mod flags;
pub mod vectorizer;

pub use controlflow::{
    add_start_stop_segment, extend_branches, merge_adjacent_blocks, remove_constant_load_in_loops,
    reorder_blocks, simplify_conditional_blocks,
};
pub use flags::{combine_same_flags, remove_useless_flags};
pub use vectorizer::vectorize_loops;
