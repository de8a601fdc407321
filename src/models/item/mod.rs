mod item;

pub use item::{
    far_future, merge_destination, ConnectionSet, ItemStatus, ItemType, Priority, ResultRecord,
    RoutedItem,
};
