//! Heap accounting structures shared by the spaces and the collector.

mod bitmap;
mod card_table;
mod mark_stack;
mod mod_union;

pub use bitmap::SpaceBitmap;
pub use card_table::{age_card, CardTable, CARD_AGED, CARD_CLEAN, CARD_DIRTY, CARD_SIZE};
pub use mark_stack::MarkStack;
pub use mod_union::ModUnionTable;
