use std::path::Path;

use crate::channel::{Channel, EncodingMode, VariantSpec, AUDIO_BITRATE_KBPS};

pub const MANIFEST_NAME: &str = "stream.m3u8";
pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";
pub const KEY_INFO_NAME: &str = "enc.keyinfo";

/// Segmenting parameters shared by every output mode: 4-second segments,
/// a rolling 10-segment playlist window, segments deleted as they rotate
/// out of the window.
const SEGMENT_DURATION_SECONDS: u32 = 4;
const PLAYLIST_WINDOW_SEGMENTS: u32 = 10;

/// Builds the full encoder argument list for a channel. Pure: the same
/// channel and output directory always produce the same argv, and nothing
/// here touches the filesystem.
pub fn build_encoder_args(channel: &Channel, output_dir: &Path) -> Vec<String> {
    let mut args = vec!["-i".to_string(), channel.source_url.clone()];
    match channel.encoding.mode {
        EncodingMode::Passthrough => {
            args.push("-c".to_string());
            args.push("copy".to_string());
            push_hls_args(&mut args, channel, output_dir, None);
            args.push(join_path(output_dir, MANIFEST_NAME));
        }
        EncodingMode::Transcode => {
            let variants = channel.encoding.resolved_variants();
            if variants.len() == 1 {
                push_single_variant_args(&mut args, variants[0]);
                push_hls_args(&mut args, channel, output_dir, None);
                args.push(join_path(output_dir, MANIFEST_NAME));
            } else {
                push_multi_variant_args(&mut args, &variants);
                push_hls_args(&mut args, channel, output_dir, Some(variants.len()));
                args.push(join_path(output_dir, "stream_%v.m3u8"));
            }
        }
    }
    args
}

/// Renders the ABR master playlist for a channel: one `#EXT-X-STREAM-INF`
/// entry per resolved variant, ladder order, each pointing at the
/// variant's own playlist.
pub fn render_master_playlist(channel: &Channel) -> String {
    let variants = channel.encoding.resolved_variants();
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for (index, spec) in variants.iter().enumerate() {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n",
            spec.bandwidth(),
            spec.resolution()
        ));
        playlist.push_str(&format!("{}\n", variant_playlist_name(index)));
    }
    playlist
}

pub fn variant_playlist_name(index: usize) -> String {
    format!("stream_{index}.m3u8")
}

fn push_single_variant_args(args: &mut Vec<String>, spec: &VariantSpec) {
    args.push("-vf".to_string());
    args.push(format!("scale=-2:{}", spec.height));
    args.push("-c:v".to_string());
    args.push("libx264".to_string());
    args.push("-preset".to_string());
    args.push("veryfast".to_string());
    args.push("-b:v".to_string());
    args.push(format!("{}k", spec.video_bitrate_kbps));
    args.push("-c:a".to_string());
    args.push("aac".to_string());
    args.push("-b:a".to_string());
    args.push(format!("{AUDIO_BITRATE_KBPS}k"));
    args.push("-ac".to_string());
    args.push("2".to_string());
}

fn push_multi_variant_args(args: &mut Vec<String>, variants: &[&VariantSpec]) {
    for _ in variants {
        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a:0".to_string());
    }
    for (index, spec) in variants.iter().enumerate() {
        args.push(format!("-filter:v:{index}"));
        args.push(format!("scale=-2:{}", spec.height));
        args.push(format!("-c:v:{index}"));
        args.push("libx264".to_string());
        args.push(format!("-b:v:{index}"));
        args.push(format!("{}k", spec.video_bitrate_kbps));
    }
    args.push("-preset".to_string());
    args.push("veryfast".to_string());
    args.push("-c:a".to_string());
    args.push("aac".to_string());
    args.push("-b:a".to_string());
    args.push(format!("{AUDIO_BITRATE_KBPS}k"));
    args.push("-ac".to_string());
    args.push("2".to_string());
    let stream_map = (0..variants.len())
        .map(|index| format!("v:{index},a:{index}"))
        .collect::<Vec<_>>()
        .join(" ");
    args.push("-var_stream_map".to_string());
    args.push(stream_map);
    args.push("-master_pl_name".to_string());
    args.push(MASTER_PLAYLIST_NAME.to_string());
}

fn push_hls_args(
    args: &mut Vec<String>,
    channel: &Channel,
    output_dir: &Path,
    variant_count: Option<usize>,
) {
    args.push("-f".to_string());
    args.push("hls".to_string());
    args.push("-hls_time".to_string());
    args.push(SEGMENT_DURATION_SECONDS.to_string());
    args.push("-hls_list_size".to_string());
    args.push(PLAYLIST_WINDOW_SEGMENTS.to_string());
    args.push("-hls_flags".to_string());
    args.push("delete_segments".to_string());
    if channel.encoding.encrypt {
        args.push("-hls_key_info_file".to_string());
        args.push(join_path(output_dir, KEY_INFO_NAME));
    }
    args.push("-hls_segment_filename".to_string());
    let pattern = if variant_count.is_some() {
        "stream_%v_%03d.ts"
    } else {
        "segment_%03d.ts"
    };
    args.push(join_path(output_dir, pattern));
}

fn join_path(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EncodingConfig, SourceType};
    use std::path::PathBuf;

    fn channel(mode: EncodingMode, variants: &[&str], encrypt: bool) -> Channel {
        Channel {
            id: "ch1".into(),
            slug: "one".into(),
            name: "One".into(),
            source_url: "http://upstream/one/index.m3u8".into(),
            source_type: SourceType::Hls,
            encoding: EncodingConfig {
                mode,
                variants: variants.iter().map(|v| v.to_string()).collect(),
                encrypt,
            },
            is_active: true,
        }
    }

    #[test]
    fn passthrough_copies_codec() {
        let dir = PathBuf::from("/var/segments/one");
        let args = build_encoder_args(&channel(EncodingMode::Passthrough, &[], false), &dir);
        let joined = args.join(" ");
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-hls_time 4"));
        assert!(joined.contains("-hls_list_size 10"));
        assert!(joined.contains("delete_segments"));
        assert!(!joined.contains("enc.keyinfo"));
        assert!(joined.ends_with("/var/segments/one/stream.m3u8"));
    }

    #[test]
    fn encrypted_passthrough_references_key_info() {
        let dir = PathBuf::from("/var/segments/one");
        let args = build_encoder_args(&channel(EncodingMode::Passthrough, &[], true), &dir);
        let joined = args.join(" ");
        assert!(joined.contains("-hls_key_info_file /var/segments/one/enc.keyinfo"));
    }

    #[test]
    fn single_variant_encodes_once() {
        let dir = PathBuf::from("/var/segments/one");
        let args = build_encoder_args(&channel(EncodingMode::Transcode, &["720p"], false), &dir);
        let joined = args.join(" ");
        assert!(joined.contains("scale=-2:720"));
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-b:a 128k"));
        assert!(!joined.contains("var_stream_map"));
    }

    #[test]
    fn multi_variant_builds_stream_map() {
        let dir = PathBuf::from("/var/segments/one");
        let args = build_encoder_args(
            &channel(EncodingMode::Transcode, &["360p", "720p"], false),
            &dir,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-var_stream_map v:0,a:0 v:1,a:1"));
        assert!(joined.contains("-master_pl_name master.m3u8"));
        assert!(joined.contains("-b:v:0 800k"));
        assert!(joined.contains("-b:v:1 2500k"));
        assert!(joined.ends_with("/var/segments/one/stream_%v.m3u8"));
    }

    #[test]
    fn builder_is_deterministic() {
        let dir = PathBuf::from("/var/segments/one");
        let ch = channel(EncodingMode::Transcode, &["480p", "1080p"], true);
        assert_eq!(build_encoder_args(&ch, &dir), build_encoder_args(&ch, &dir));
        assert_eq!(render_master_playlist(&ch), render_master_playlist(&ch));
    }
}
