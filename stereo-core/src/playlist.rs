//! Playlist of single files and dual-file stereo pairs.

use crate::stereo::{StereoFormat, StereoParams};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One playable item: a single file, or a left/right pair of files
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub files: Vec<PathBuf>,
    pub params: Arc<StereoParams>,
}

impl PlaylistEntry {
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self {
            files: vec![path.into()],
            params: StereoParams::new(StereoFormat::Auto),
        }
    }

    pub fn pair(left: impl Into<PathBuf>, right: impl Into<PathBuf>) -> Self {
        Self {
            files: vec![left.into(), right.into()],
            params: StereoParams::new(StereoFormat::SeparateFrames),
        }
    }

    pub fn is_pair(&self) -> bool {
        self.files.len() > 1
    }

    /// File name of the first file
    pub fn title(&self) -> String {
        self.files
            .first()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Items {
    entries: Vec<PlaylistEntry>,
    current: usize,
}

#[derive(Debug, Default)]
pub struct Playlist {
    items: Mutex<Items>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl AsRef<Path>) {
        self.add_entry(PlaylistEntry::single(path.as_ref()));
    }

    pub fn add_pair(&self, left: impl AsRef<Path>, right: impl AsRef<Path>) {
        self.add_entry(PlaylistEntry::pair(left.as_ref(), right.as_ref()));
    }

    pub fn add_entry(&self, entry: PlaylistEntry) {
        self.items.lock().entries.push(entry);
    }

    pub fn clear(&self) {
        let mut items = self.items.lock();
        items.entries.clear();
        items.current = 0;
    }

    pub fn current(&self) -> Option<PlaylistEntry> {
        let items = self.items.lock();
        items.entries.get(items.current).cloned()
    }

    pub fn current_index(&self) -> usize {
        self.items.lock().current
    }

    pub fn set_current(&self, index: usize) -> bool {
        let mut items = self.items.lock();
        if index >= items.entries.len() {
            return false;
        }
        items.current = index;
        true
    }

    /// Advance; wraps to the first entry when `loop_all` is set
    pub fn walk_to_next(&self, loop_all: bool) -> bool {
        let mut items = self.items.lock();
        if items.current + 1 < items.entries.len() {
            items.current += 1;
            true
        } else if loop_all && !items.entries.is_empty() {
            items.current = 0;
            true
        } else {
            false
        }
    }

    pub fn walk_to_prev(&self) -> bool {
        let mut items = self.items.lock();
        if items.current > 0 && !items.entries.is_empty() {
            items.current -= 1;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn titles(&self) -> Vec<String> {
        self.items.lock().entries.iter().map(PlaylistEntry::title).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk() {
        let playlist = Playlist::new();
        assert!(playlist.current().is_none());
        assert!(!playlist.walk_to_next(true));

        playlist.add_file("/media/a.mkv");
        playlist.add_pair("/media/left.mp4", "/media/right.mp4");
        playlist.add_file("/media/c.mkv");

        assert_eq!(playlist.current().unwrap().title(), "a.mkv");
        assert!(!playlist.walk_to_prev());
        assert!(playlist.walk_to_next(false));

        let pair = playlist.current().unwrap();
        assert!(pair.is_pair());
        assert_eq!(pair.params.src_format(), StereoFormat::SeparateFrames);

        assert!(playlist.walk_to_next(false));
        assert!(!playlist.walk_to_next(false));
        assert_eq!(playlist.current_index(), 2);
        assert!(playlist.walk_to_next(true));
        assert_eq!(playlist.current_index(), 0);
    }

    #[test]
    fn test_set_current_and_clear() {
        let playlist = Playlist::new();
        playlist.add_file("one.mp4");
        playlist.add_file("two.mp4");
        assert!(playlist.set_current(1));
        assert!(!playlist.set_current(2));
        assert!(playlist.walk_to_prev());
        assert_eq!(playlist.titles(), vec!["one.mp4", "two.mp4"]);

        playlist.clear();
        assert!(playlist.is_empty());
        assert_eq!(playlist.current_index(), 0);
    }
}
