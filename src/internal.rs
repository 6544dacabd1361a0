pub mod card_table;
pub mod space_bitmap;
