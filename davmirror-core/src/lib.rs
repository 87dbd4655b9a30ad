pub mod dav;
pub mod disk;
pub mod paths;

pub use dav::{
    CrawlTree, DavClient, DavEntry, DavError, DavOptions, Depth, MultistatusError, TreeCrawler,
};
pub use disk::{DiskClient, DiskError, DiskOptions, DiskResource, DiskResourceType, TransferLink};
