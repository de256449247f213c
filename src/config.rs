use std::path::Path;

use serde::Deserialize;
use strum_macros::{AsRefStr, EnumString};

use crate::error::{ConfigError, Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RnnType {
    #[default]
    Lstm,
    Gru,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubsampleType {
    /// Keep every other frame.
    #[default]
    Drop,
    /// Merge adjacent frames into one vector of twice the width.
    Concat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttentionType {
    Content,
    #[default]
    Location,
    DotProduct,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecodingOrder {
    #[default]
    AttendGenerateUpdate,
    AttendUpdateGenerate,
    Conditional,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InitDecState {
    Zero,
    Mean,
    Final,
    #[default]
    First,
}

/// How much of the sub-task decoder is conditioned on the main decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UsageDecSub {
    #[default]
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    Independent,
    /// Main context feeds the sub decoder's recurrent update only.
    UpdateDecoder,
    /// Main context feeds both the recurrent update and the output layer.
    All,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Task {
    #[default]
    Main,
    Sub,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub rnn_type: RnnType,
    pub bidirectional: bool,
    pub num_units: usize,
    pub num_proj: usize,
    pub num_layers: usize,
    pub subsample_list: Vec<bool>,
    pub subsample_type: SubsampleType,
    pub residual: bool,
    pub dense_residual: bool,
    pub dropout_input: f32,
    pub dropout_hidden: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            rnn_type: RnnType::Lstm,
            bidirectional: true,
            num_units: 320,
            num_proj: 0,
            num_layers: 5,
            subsample_list: vec![],
            subsample_type: SubsampleType::Drop,
            residual: false,
            dense_residual: false,
            dropout_input: 0.0,
            dropout_hidden: 0.0,
        }
    }
}

impl EncoderConfig {
    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Width of a single layer's output before any subsampling.
    pub fn layer_units(&self) -> usize {
        if self.num_proj > 0 {
            self.num_proj
        } else {
            self.num_units * self.num_directions()
        }
    }

    pub fn subsample_at(&self, layer: usize) -> bool {
        self.subsample_list.get(layer).copied().unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub attention_type: AttentionType,
    pub attention_dim: usize,
    pub num_heads: usize,
    pub sharpening_factor: f64,
    pub sigmoid_smoothing: bool,
    pub coverage_weight: f64,
    pub conv_num_channels: usize,
    pub conv_width: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            attention_type: AttentionType::Location,
            attention_dim: 128,
            num_heads: 1,
            sharpening_factor: 1.0,
            sigmoid_smoothing: false,
            coverage_weight: 0.0,
            conv_num_channels: 10,
            conv_width: 201,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub rnn_type: RnnType,
    pub num_units: usize,
    pub num_layers: usize,
    pub embedding_dim: usize,
    pub dropout: f32,
    pub dropout_embedding: f32,
    pub residual: bool,
    pub dense_residual: bool,
    pub bottleneck_dim: usize,
    pub init_dec_state: InitDecState,
    pub decoding_order: DecodingOrder,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            rnn_type: RnnType::Lstm,
            num_units: 320,
            num_layers: 1,
            embedding_dim: 32,
            dropout: 0.0,
            dropout_embedding: 0.0,
            residual: false,
            dense_residual: false,
            bottleneck_dim: 256,
            init_dec_state: InitDecState::First,
            decoding_order: DecodingOrder::AttendGenerateUpdate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubTaskConfig {
    /// 1-based encoder depth at which the sub-task representation is captured.
    pub encoder_num_layers_sub: usize,
    pub attention: AttentionConfig,
    pub decoder: DecoderConfig,
    pub sub_loss_weight: f64,
    /// Share of the sub-task loss taken by CTC; 1.0 means a pure CTC sub-task.
    pub ctc_loss_weight_sub: f64,
    pub usage_dec_sub: UsageDecSub,
}

impl Default for SubTaskConfig {
    fn default() -> Self {
        Self {
            encoder_num_layers_sub: 1,
            attention: AttentionConfig::default(),
            decoder: DecoderConfig::default(),
            sub_loss_weight: 0.2,
            ctc_loss_weight_sub: 0.0,
            usage_dec_sub: UsageDecSub::Independent,
        }
    }
}

impl SubTaskConfig {
    pub fn has_attention(&self) -> bool {
        self.ctc_loss_weight_sub < 1.0
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub main_loss_weight: f64,
    /// Share of the main-task loss taken by CTC.
    pub ctc_loss_weight: f64,
    pub scheduled_sampling_prob: f64,
    pub scheduled_sampling_max_step: usize,
    pub label_smoothing_prob: f64,
    pub logits_temperature: f64,
    pub att_reg_weight: f64,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            main_loss_weight: 1.0,
            ctc_loss_weight: 0.0,
            scheduled_sampling_prob: 0.0,
            scheduled_sampling_max_step: 0,
            label_smoothing_prob: 0.0,
            logits_temperature: 1.0,
            att_reg_weight: 0.0,
            seed: 1623,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub beam_width: usize,
    pub max_decode_len: usize,
    /// Added to the score for every emitted token.
    pub length_penalty: f64,
    pub coverage_penalty: f64,
    /// Mixing coefficient of the CTC prefix score in joint decoding.
    pub ctc_weight: f64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            max_decode_len: 100,
            length_penalty: 0.0,
            coverage_penalty: 0.0,
            ctc_weight: 0.0,
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.beam_width < 1 {
            return Err(ConfigError::InvalidBeamWidth(self.beam_width));
        }
        if self.max_decode_len < 1 {
            return Err(ConfigError::InvalidLayerCount {
                what: "max decode length",
                count: self.max_decode_len,
            });
        }
        check_finite("length_penalty", self.length_penalty)?;
        check_weight("coverage_penalty", self.coverage_penalty)?;
        check_fraction("ctc_weight", self.ctc_weight)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input_size: usize,
    pub bridge_layer: bool,
    pub encoder: EncoderConfig,
    pub attention: AttentionConfig,
    pub decoder: DecoderConfig,
    pub sub_task: Option<SubTaskConfig>,
    pub training: TrainingConfig,
    pub decode: DecodeConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config =
            std::fs::read_to_string(path).map_err(|e| Error::io("read config file", e))?;
        let config: Config =
            serde_json::from_str(&config).map_err(|e| Error::json("parse config file", e))?;
        config.validate()?;
        Ok(config)
    }

    /// The main task keeps an attention decoder unless CTC takes its whole loss.
    pub fn has_main_attention(&self) -> bool {
        self.training.ctc_loss_weight < 1.0
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.input_size == 0 {
            return Err(ConfigError::InvalidLayerCount {
                what: "input feature",
                count: 0,
            });
        }

        let enc = &self.encoder;
        if enc.num_layers == 0 || enc.num_units == 0 {
            return Err(ConfigError::InvalidLayerCount {
                what: "encoder",
                count: enc.num_layers.min(enc.num_units),
            });
        }
        if !enc.subsample_list.is_empty() && enc.subsample_list.len() != enc.num_layers {
            return Err(ConfigError::SubsampleListLength {
                len: enc.subsample_list.len(),
                num_layers: enc.num_layers,
            });
        }
        if enc.residual && enc.dense_residual {
            return Err(ConfigError::ConflictingResidual { what: "encoder" });
        }
        check_probability("encoder.dropout_input", enc.dropout_input as f64)?;
        check_probability("encoder.dropout_hidden", enc.dropout_hidden as f64)?;

        validate_attention(&self.attention)?;
        validate_decoder(&self.decoder)?;

        if let Some(sub) = &self.sub_task {
            if sub.encoder_num_layers_sub == 0 || sub.encoder_num_layers_sub > enc.num_layers {
                return Err(ConfigError::SubLayerOutOfRange {
                    index: sub.encoder_num_layers_sub,
                    num_layers: enc.num_layers,
                });
            }
            check_weight("sub_loss_weight", sub.sub_loss_weight)?;
            check_fraction("ctc_loss_weight_sub", sub.ctc_loss_weight_sub)?;
            if sub.has_attention() {
                validate_attention(&sub.attention)?;
                validate_decoder(&sub.decoder)?;
            } else if sub.usage_dec_sub != UsageDecSub::Independent {
                return Err(ConfigError::MissingSubTask("usage_dec_sub"));
            }
            if sub.usage_dec_sub != UsageDecSub::Independent && !self.has_main_attention() {
                return Err(ConfigError::MissingMainDecoder("usage_dec_sub"));
            }
        }

        let train = &self.training;
        check_weight("main_loss_weight", train.main_loss_weight)?;
        check_fraction("ctc_loss_weight", train.ctc_loss_weight)?;
        check_weight("att_reg_weight", train.att_reg_weight)?;
        check_probability("scheduled_sampling_prob", train.scheduled_sampling_prob)?;
        if train.scheduled_sampling_prob > 0.0 && train.scheduled_sampling_max_step == 0 {
            return Err(ConfigError::ScheduledSamplingStep {
                prob: train.scheduled_sampling_prob,
            });
        }
        check_probability("label_smoothing_prob", train.label_smoothing_prob)?;
        if !(train.logits_temperature > 0.0 && train.logits_temperature.is_finite()) {
            return Err(ConfigError::InvalidWeight {
                name: "logits_temperature",
                value: train.logits_temperature,
            });
        }

        self.decode.validate()
    }
}

fn validate_attention(att: &AttentionConfig) -> std::result::Result<(), ConfigError> {
    if att.num_heads == 0 {
        return Err(ConfigError::InvalidAttention("num_heads must be >= 1".into()));
    }
    if att.attention_dim == 0 {
        return Err(ConfigError::InvalidAttention(
            "attention_dim must be >= 1".into(),
        ));
    }
    if !(att.sharpening_factor > 0.0 && att.sharpening_factor.is_finite()) {
        return Err(ConfigError::InvalidAttention(format!(
            "sharpening_factor must be positive, got {}",
            att.sharpening_factor
        )));
    }
    check_weight("coverage_weight", att.coverage_weight)?;
    if att.attention_type == AttentionType::Location {
        if att.conv_width % 2 == 0 {
            return Err(ConfigError::InvalidAttention(format!(
                "conv_width must be odd, got {}",
                att.conv_width
            )));
        }
        if att.conv_num_channels == 0 {
            return Err(ConfigError::InvalidAttention(
                "conv_num_channels must be >= 1".into(),
            ));
        }
    }
    Ok(())
}

fn validate_decoder(dec: &DecoderConfig) -> std::result::Result<(), ConfigError> {
    if dec.num_layers == 0 || dec.num_units == 0 {
        return Err(ConfigError::InvalidLayerCount {
            what: "decoder",
            count: dec.num_layers.min(dec.num_units),
        });
    }
    if dec.decoding_order == DecodingOrder::Conditional && dec.num_layers != 1 {
        return Err(ConfigError::InvalidLayerCount {
            what: "conditional decoder",
            count: dec.num_layers,
        });
    }
    if dec.embedding_dim == 0 || dec.bottleneck_dim == 0 {
        return Err(ConfigError::InvalidLayerCount {
            what: "decoder embedding/bottleneck",
            count: 0,
        });
    }
    if dec.residual && dec.dense_residual {
        return Err(ConfigError::ConflictingResidual { what: "decoder" });
    }
    check_probability("decoder.dropout", dec.dropout as f64)?;
    check_probability("decoder.dropout_embedding", dec.dropout_embedding as f64)?;
    Ok(())
}

fn check_probability(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidProbability { name, value })
    }
}

fn check_fraction(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraction { name, value })
    }
}

fn check_weight(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeight { name, value })
    }
}

fn check_finite(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeight { name, value })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn small() -> Config {
        Config {
            input_size: 8,
            encoder: EncoderConfig {
                num_units: 4,
                num_layers: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn default_small_config_is_valid() {
        assert_eq!(small().validate(), Ok(()));
    }

    #[test]
    fn sub_layer_beyond_encoder_depth_is_rejected() {
        let config = Config {
            sub_task: Some(SubTaskConfig {
                encoder_num_layers_sub: 4,
                ..Default::default()
            }),
            ..small()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SubLayerOutOfRange {
                index: 4,
                num_layers: 3
            })
        );
    }

    #[test]
    fn zero_beam_width_is_rejected() {
        let mut config = small();
        config.decode.beam_width = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBeamWidth(0)));
    }

    #[test]
    fn subsample_list_must_cover_every_layer() {
        let mut config = small();
        config.encoder.subsample_list = vec![true, false];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SubsampleListLength { len: 2, .. })
        ));
    }

    #[test]
    fn scheduled_sampling_requires_max_step() {
        let mut config = small();
        config.training.scheduled_sampling_prob = 0.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ScheduledSamplingStep { .. })
        ));
    }

    #[test]
    fn parses_json_with_defaults() {
        let json = r#"{
            "input_size": 40,
            "encoder": { "num_units": 16, "num_layers": 3, "subsample_list": [true, true, false] },
            "attention": { "attention_type": "content", "num_heads": 2 },
            "decoder": { "decoding_order": "attend_update_generate" },
            "sub_task": { "encoder_num_layers_sub": 2, "usage_dec_sub": "none" },
            "decode": { "beam_width": 3 }
        }"#;
        let config: Config = serde_json::from_str(json).expect("valid config json");
        assert_eq!(config.encoder.rnn_type, RnnType::Lstm);
        assert_eq!(config.attention.attention_type, AttentionType::Content);
        assert_eq!(
            config.decoder.decoding_order,
            DecodingOrder::AttendUpdateGenerate
        );
        let sub = config.sub_task.as_ref().expect("sub task");
        assert_eq!(sub.usage_dec_sub, UsageDecSub::Independent);
        assert_eq!(config.decode.beam_width, 3);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn enum_names_round_trip_through_strum() {
        assert_eq!(Task::from_str("sub"), Ok(Task::Sub));
        assert_eq!(UsageDecSub::UpdateDecoder.as_ref(), "update_decoder");
        assert_eq!(UsageDecSub::from_str("none"), Ok(UsageDecSub::Independent));
    }
}
