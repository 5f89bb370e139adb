mod article;
mod attachment;
mod product;

pub use article::{Article, ArticleDraft};
pub use attachment::{Attachment, AttachmentMeta};
pub use product::{normalize_product_name, product_key, Product};
