use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::ModelManager;
use crate::resume::{base_name, video_folder};

/// Marker in the file name of the isolated vocal stem.
pub const VOCALS_MARKER: &str = "(Vocals)";

/// Separator output names use "Instrumental"; files next to the video say "Background".
pub fn stem_file_name(name: &str) -> String {
    name.replace("(Instrumental)", "(Background)")
}

/// A vocal stem already sitting next to the video from an earlier run.
pub async fn find_existing_vocals(video: &Path) -> Option<PathBuf> {
    let base = base_name(video).ok()?;
    let mut entries = fs::read_dir(video_folder(video)).await.ok()?;
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&base) && name.contains(VOCALS_MARKER) {
            found.push(entry.path());
        }
    }
    found.sort();
    found.into_iter().next()
}

/// Separate `audio` and move the stems next to `video`. Returns the vocal
/// stem when the separator produced one.
pub async fn separate_vocals(audio: &Path, video: &Path, models: &mut ModelManager) -> Result<Option<PathBuf>> {
    let folder = video_folder(video);
    let scratch = tempfile::Builder::new()
        .prefix(".subforge-separation")
        .tempdir_in(&folder)?;

    info!("Isolating vocals from {}", audio.display());
    let stems = {
        let separator = models.get_separator().await?;
        separator.separate(audio, scratch.path()).await?
    };

    let mut vocals = None;
    for stem in stems {
        let Some(name) = stem.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let target = folder.join(stem_file_name(&name));
        fs::rename(&stem, &target).await?;
        debug!("Stem moved to {}", target.display());
        if name.contains("Vocals") {
            vocals = Some(target);
        }
    }
    Ok(vocals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrumental_becomes_background() {
        assert_eq!(
            stem_file_name("film_temp_(Instrumental)_model.wav"),
            "film_temp_(Background)_model.wav"
        );
        assert_eq!(stem_file_name("film_temp_(Vocals)_model.wav"), "film_temp_(Vocals)_model.wav");
    }

    #[tokio::test]
    async fn existing_vocals_must_share_the_base_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other_(Vocals).wav"), b"v").unwrap();
        let video = dir.path().join("film.mkv");
        assert!(find_existing_vocals(&video).await.is_none());

        std::fs::write(dir.path().join("film_temp_(Vocals)_m.wav"), b"v").unwrap();
        assert_eq!(
            find_existing_vocals(&video).await,
            Some(dir.path().join("film_temp_(Vocals)_m.wav"))
        );
    }
}
