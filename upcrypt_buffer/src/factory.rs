use std::path::{Path, PathBuf};

use crate::item::BufferedItem;

/// Threshold used when none is configured: 10 KiB.
pub const DEFAULT_SIZE_THRESHOLD: usize = 10_240;

/// Creates [`BufferedItem`]s that share a size threshold and repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFactory {
    size_threshold: usize,
    repository: Option<PathBuf>,
}

impl Default for ItemFactory {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_THRESHOLD, None)
    }
}

impl ItemFactory {
    /// Items keep up to `size_threshold` bytes in memory. Anything larger is
    /// encrypted into `repository`, or the system temp directory if `None`.
    pub fn new(size_threshold: usize, repository: Option<PathBuf>) -> Self {
        Self {
            size_threshold,
            repository,
        }
    }

    pub fn size_threshold(&self) -> usize {
        self.size_threshold
    }

    pub fn set_size_threshold(&mut self, size_threshold: usize) {
        self.size_threshold = size_threshold;
    }

    pub fn repository(&self) -> Option<&Path> {
        self.repository.as_deref()
    }

    pub fn set_repository(&mut self, repository: Option<PathBuf>) {
        self.repository = repository;
    }

    pub fn create_item(
        &self,
        field_name: Option<String>,
        content_type: Option<String>,
        is_form_field: bool,
        file_name: Option<String>,
    ) -> BufferedItem {
        BufferedItem::new(
            field_name,
            content_type,
            is_form_field,
            file_name,
            self.size_threshold,
            self.repository.clone(),
        )
    }
}
