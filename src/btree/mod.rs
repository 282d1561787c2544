pub mod commit;
pub mod fragment;
pub mod node;
pub mod node_cache;
mod node_edit;
pub mod page_store;
pub mod split;
pub mod tree;
