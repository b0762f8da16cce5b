use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

/// A track announced by a publisher. Simulcast layers of the same track share `id` and
/// differ by `rid` and `ssrc`.
#[derive(Debug, Clone)]
pub struct UpTrack {
    pub id: String,
    pub stream_id: String,
    /// RTP stream id, empty when the track is not simulcast.
    pub rid: String,
    pub kind: RTPCodecType,
    pub ssrc: u32,
    pub codec: RTCRtpCodecParameters,
}

impl UpTrack {
    pub fn new(
        id: String,
        stream_id: String,
        rid: String,
        kind: RTPCodecType,
        ssrc: u32,
        codec: RTCRtpCodecParameters,
    ) -> Self {
        Self {
            id,
            stream_id,
            rid,
            kind,
            ssrc,
            codec,
        }
    }

    pub fn msid(&self) -> String {
        format!("{} {}", self.stream_id, self.id)
    }

    pub fn mime_type(&self) -> &str {
        &self.codec.capability.mime_type
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn video_track(id: &str, rid: &str, ssrc: u32) -> UpTrack {
        UpTrack::new(
            id.to_string(),
            "stream".to_string(),
            rid.to_string(),
            RTPCodecType::Video,
            ssrc,
            crate::buffer::tests::vp8_params(None).codecs[0].clone(),
        )
    }

    #[test]
    fn msid() {
        let track = video_track("video", "", 1);
        assert_eq!(track.msid(), "stream video");
        assert_eq!(track.mime_type(), "video/VP8");
    }
}
