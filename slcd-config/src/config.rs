//! Experiment configuration format.

use crate::common::*;

pub use backbone::*;
pub use dataset::*;
pub use matcher::*;
pub use network::*;
pub use testing::*;
pub use training::*;
pub use tuning::*;

/// The main experiment configuration.
///
/// Every field can be omitted in the configuration file. Missing fields
/// take the values of [Config::default].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dataset_name: DatasetName,
    /// The GPU device index.
    pub gpu: usize,
    /// The model name prefix of the experiment name.
    pub model_name: String,
    /// If set, save visualized predictions.
    pub viz: bool,
    pub run_mode: RunMode,
    /// If set, save the intermediate detector outputs in pickle format.
    pub save_pickle: bool,
    pub dataset: DatasetConfig,
    pub backbone: BackboneConfig,
    pub network: NetworkConfig,
    pub matcher: MatcherConfig,
    pub training: TrainingConfig,
    pub testing: TestingConfig,
    pub tuning: TuningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_name: DatasetName::Sel,
            gpu: 2,
            model_name: "combination_".into(),
            viz: false,
            run_mode: RunMode::TestPaper,
            save_pickle: false,
            dataset: Default::default(),
            backbone: Default::default(),
            network: Default::default(),
            matcher: Default::default(),
            training: Default::default(),
            testing: Default::default(),
            tuning: Default::default(),
        }
    }
}

impl Config {
    /// Load a JSON5 configuration file.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        Ok(config)
    }

    /// Check the value ranges and the consistency across groups.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.model_name.contains(std::path::is_separator),
            "model_name '{}' must not contain a path separator",
            self.model_name
        );

        self.dataset.validate()?;
        self.network.validate()?;
        self.matcher.validate()?;
        self.training.validate()?;
        self.testing.validate(&self.training)?;
        self.tuning.validate()?;

        Ok(())
    }
}

/// Datasets the network is evaluated on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    StrumDisplay,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum DatasetName {
    #[serde(rename = "SEL")]
    #[strum(serialize = "SEL")]
    Sel,
    #[serde(rename = "SEL_Hard")]
    #[strum(serialize = "SEL_Hard")]
    SelHard,
    #[serde(rename = "NKL")]
    #[strum(serialize = "NKL")]
    Nkl,
    #[serde(rename = "CDL")]
    #[strum(serialize = "CDL")]
    Cdl,
}

impl DatasetName {
    /// True for the hard subset of SEL, which has no checkpoints of its own.
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::SelHard)
    }

    /// The dataset whose checkpoints are loaded for this dataset.
    pub fn checkpoint_source(&self) -> Self {
        match self {
            Self::SelHard => Self::Sel,
            other => *other,
        }
    }

    /// The maximum number of semantic lines per image.
    pub fn max_lines(&self) -> usize {
        match self {
            Self::Sel | Self::SelHard => 6,
            Self::Nkl | Self::Cdl => 8,
        }
    }
}

/// The program mode, which decides where checkpoints are loaded from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunMode {
    Train,
    Test,
    /// Evaluate the released paper checkpoints.
    TestPaper,
}

mod dataset {
    use super::*;

    /// Dataset loading options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DatasetConfig {
        /// The side length of the square input image.
        pub image_size: NonZeroUsize,
        pub batch_size: NonZeroUsize,
        pub num_workers: usize,
        /// Per-channel normalization mean.
        pub mean: [R64; 3],
        /// Per-channel normalization standard deviation.
        pub std: [R64; 3],
        /// The maximum line angle in degrees.
        pub max_theta: usize,
    }

    impl Default for DatasetConfig {
        fn default() -> Self {
            Self {
                image_size: NonZeroUsize::new(480).unwrap(),
                batch_size: NonZeroUsize::new(2).unwrap(),
                num_workers: 4,
                mean: [r64(0.485), r64(0.456), r64(0.406)],
                std: [r64(0.229), r64(0.224), r64(0.225)],
                max_theta: 90,
            }
        }
    }

    impl DatasetConfig {
        pub(super) fn validate(&self) -> Result<()> {
            ensure!(
                self.std.iter().all(|v| v.raw() > 0.0),
                "dataset.std must be positive"
            );
            ensure!(self.max_theta > 0, "dataset.max_theta must be positive");
            Ok(())
        }
    }
}

mod backbone {
    use super::*;

    /// The pretrained feature extractor.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRefStr,
        StrumDisplay,
        EnumString,
        Serialize,
        Deserialize,
    )]
    #[serde(rename_all = "lowercase")]
    #[strum(serialize_all = "lowercase")]
    pub enum BackboneKind {
        ResNet18,
        ResNet34,
        ResNet50,
        ResNet101,
        ResNet152,
    }

    /// Backbone options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BackboneConfig {
        pub name: BackboneKind,
        /// If set, the backbone parameters are updated in training.
        pub train_backbone: bool,
        /// If set, load the pretrained backbone weights.
        pub pretrained: bool,
        pub dim_feedforward: usize,
    }

    impl Default for BackboneConfig {
        fn default() -> Self {
            Self {
                name: BackboneKind::ResNet50,
                train_backbone: true,
                pretrained: true,
                dim_feedforward: 2048,
            }
        }
    }
}

mod network {
    use super::*;

    /// Transformer options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct NetworkConfig {
        pub hidden_dim: usize,
        pub query_dim: usize,
        pub nheads: usize,
        pub dropout: R64,
        pub gaussian_sigma: R64,
        pub n_enc_layers: usize,
        pub n_dec_layers: usize,
    }

    impl Default for NetworkConfig {
        fn default() -> Self {
            Self {
                hidden_dim: 96,
                query_dim: 2,
                nheads: 6,
                dropout: r64(0.0),
                gaussian_sigma: r64(20.0),
                n_enc_layers: 3,
                n_dec_layers: 3,
            }
        }
    }

    impl NetworkConfig {
        pub(super) fn validate(&self) -> Result<()> {
            ensure!(self.nheads > 0, "network.nheads must be positive");
            ensure!(
                self.hidden_dim % self.nheads == 0,
                "network.hidden_dim ({}) must be divisible by network.nheads ({})",
                self.hidden_dim,
                self.nheads
            );
            ensure!(
                is_unit_interval(self.dropout),
                "network.dropout must be in range [0, 1]"
            );
            ensure!(
                self.gaussian_sigma > 0.0,
                "network.gaussian_sigma must be positive"
            );
            Ok(())
        }
    }
}

mod matcher {
    use super::*;

    /// Bipartite matching cost options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct MatcherConfig {
        pub set_cost_class: R64,
        pub set_cost_line: R64,
        pub focal_alpha: R64,
    }

    impl Default for MatcherConfig {
        fn default() -> Self {
            Self {
                set_cost_class: r64(0.0),
                set_cost_line: r64(1.0),
                focal_alpha: r64(0.25),
            }
        }
    }

    impl MatcherConfig {
        pub(super) fn validate(&self) -> Result<()> {
            ensure!(
                self.set_cost_class >= 0.0 && self.set_cost_line >= 0.0,
                "matcher costs must be non-negative"
            );
            ensure!(
                is_unit_interval(self.focal_alpha),
                "matcher.focal_alpha must be in range [0, 1]"
            );
            Ok(())
        }
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TrainingConfig {
        pub epochs: usize,
        /// The learning rate of backbone parameters.
        pub backbone_lr: R64,
        /// The learning rate of the remaining parameters.
        pub lr: R64,
        pub optimizer: OptimizerConfig,
        pub scheduler: SchedulerConfig,
        /// If set, apply the loss to every decoder layer output.
        pub aux_loss: bool,
        pub interm_loss: bool,
        pub interm_loss_coef: R64,
        pub loss_kld_coef: R64,
        pub loss_cls_coef: R64,
        pub loss_reg_coef: R64,
        /// The angle tolerance in degrees for a positive line match.
        pub threshold_theta: R64,
        /// The radius tolerance in pixels for a positive line match.
        pub threshold_radius: R64,
    }

    impl Default for TrainingConfig {
        fn default() -> Self {
            Self {
                epochs: 300,
                backbone_lr: r64(1e-4),
                lr: r64(1e-4),
                optimizer: Default::default(),
                scheduler: Default::default(),
                aux_loss: true,
                interm_loss: false,
                interm_loss_coef: r64(0.5),
                loss_kld_coef: r64(0.05),
                loss_cls_coef: r64(1.0),
                loss_reg_coef: r64(5.0),
                threshold_theta: r64(2.5),
                threshold_radius: r64(4.0),
            }
        }
    }

    impl TrainingConfig {
        pub(super) fn validate(&self) -> Result<()> {
            ensure!(self.epochs > 0, "training.epochs must be positive");
            ensure!(
                self.backbone_lr > 0.0 && self.lr > 0.0,
                "training learning rates must be positive"
            );
            ensure!(
                is_unit_interval(self.interm_loss_coef),
                "training.interm_loss_coef must be in range [0, 1]"
            );
            ensure!(
                [self.loss_kld_coef, self.loss_cls_coef, self.loss_reg_coef]
                    .iter()
                    .all(|coef| *coef >= 0.0),
                "training loss coefficients must be non-negative"
            );
            ensure!(
                self.threshold_theta > 0.0 && self.threshold_radius > 0.0,
                "training match thresholds must be positive"
            );

            self.optimizer.validate()?;
            self.scheduler.validate()?;

            if let Some(&last) = self.scheduler.milestones.last() {
                ensure!(
                    last < self.epochs,
                    "the last milestone {} must be less than training.epochs ({})",
                    last,
                    self.epochs
                );
            }

            Ok(())
        }
    }

    /// Optimizer variants.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRefStr,
        StrumDisplay,
        EnumString,
        Serialize,
        Deserialize,
    )]
    #[serde(rename_all = "snake_case")]
    #[strum(serialize_all = "snake_case")]
    pub enum OptimizerMode {
        AdamW,
        Adam,
    }

    /// The optimizer options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct OptimizerConfig {
        pub mode: OptimizerMode,
        pub weight_decay: R64,
        pub betas: (R64, R64),
        pub eps: R64,
    }

    impl Default for OptimizerConfig {
        fn default() -> Self {
            Self {
                mode: OptimizerMode::AdamW,
                weight_decay: r64(1e-4),
                betas: (r64(0.9), r64(0.999)),
                eps: r64(1e-8),
            }
        }
    }

    impl OptimizerConfig {
        fn validate(&self) -> Result<()> {
            let (beta1, beta2) = self.betas;
            ensure!(
                self.weight_decay >= 0.0,
                "optimizer.weight_decay must be non-negative"
            );
            ensure!(
                (0.0..1.0).contains(&beta1.raw()) && (0.0..1.0).contains(&beta2.raw()),
                "optimizer.betas must be in range [0, 1)"
            );
            ensure!(self.eps > 0.0, "optimizer.eps must be positive");
            Ok(())
        }
    }

    /// Learning rate scheduler variants.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRefStr,
        StrumDisplay,
        EnumString,
        Serialize,
        Deserialize,
    )]
    pub enum SchedulerKind {
        /// Decay the learning rate by gamma at each milestone epoch.
        MultiStepLR,
    }

    /// The learning rate scheduling options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SchedulerConfig {
        pub kind: SchedulerKind,
        /// Epochs at which the learning rate decays.
        pub milestones: Vec<usize>,
        /// The decay factor.
        pub gamma: R64,
    }

    impl Default for SchedulerConfig {
        fn default() -> Self {
            Self {
                kind: SchedulerKind::MultiStepLR,
                milestones: vec![30, 60, 90, 120, 150],
                gamma: r64(0.5),
            }
        }
    }

    impl SchedulerConfig {
        pub(crate) fn validate(&self) -> Result<()> {
            ensure!(
                self.gamma > 0.0 && self.gamma <= 1.0,
                "scheduler.gamma must be in range (0, 1]"
            );
            ensure!(
                self.milestones
                    .iter()
                    .tuple_windows()
                    .all(|(prev, next)| prev < next),
                "scheduler.milestones must be strictly increasing"
            );
            Ok(())
        }
    }
}

mod testing {
    use super::*;

    /// The evaluation options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TestingConfig {
        /// The first epoch that runs evaluation.
        pub start_eval_epoch: usize,
        pub prob_threshold: R64,
        pub test_nms_threshold: R64,
    }

    impl Default for TestingConfig {
        fn default() -> Self {
            Self {
                start_eval_epoch: 1,
                prob_threshold: r64(0.5),
                test_nms_threshold: r64(0.01),
            }
        }
    }

    impl TestingConfig {
        pub(super) fn validate(&self, training: &TrainingConfig) -> Result<()> {
            ensure!(
                self.start_eval_epoch <= training.epochs,
                "testing.start_eval_epoch ({}) exceeds training.epochs ({})",
                self.start_eval_epoch,
                training.epochs
            );
            ensure!(
                is_unit_interval(self.prob_threshold),
                "testing.prob_threshold must be in range [0, 1]"
            );
            ensure!(
                is_unit_interval(self.test_nms_threshold),
                "testing.test_nms_threshold must be in range [0, 1]"
            );
            Ok(())
        }
    }
}

mod tuning {
    use super::*;

    /// Ablation options. They also decide the experiment name.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TuningConfig {
        /// Use semantic features instead of image features.
        pub use_semantic_feat: bool,
        /// Enable the KL-divergence loss.
        #[serde(rename = "use_KLD")]
        pub use_kld: bool,
        pub num_region_queries: usize,
        pub num_anchors: usize,
        pub topk: usize,
    }

    impl Default for TuningConfig {
        fn default() -> Self {
            Self {
                use_semantic_feat: true,
                use_kld: true,
                num_region_queries: 8,
                num_anchors: 1024,
                topk: 8,
            }
        }
    }

    impl TuningConfig {
        pub(super) fn validate(&self) -> Result<()> {
            ensure!(
                self.num_region_queries > 0 && self.num_anchors > 0,
                "tuning query counts must be positive"
            );
            ensure!(
                self.topk > 0 && self.topk <= self.num_anchors,
                "tuning.topk ({}) must be in range [1, {}]",
                self.topk,
                self.num_anchors
            );
            Ok(())
        }

        /// The experiment name. It is a function of the tuning options only.
        pub fn exp_name(&self) -> String {
            let feat = if self.use_semantic_feat {
                "semantic_feat"
            } else {
                "image_feat"
            };
            let kld = if self.use_kld { "w_KLD" } else { "wo_KLD" };
            format!(
                "MS_agg_mq{}_nq{}_{}_{}",
                self.num_region_queries, self.num_anchors, feat, kld
            )
        }
    }
}

fn is_unit_interval(value: R64) -> bool {
    value >= 0.0 && value <= 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() -> Result<()> {
        Config::default().validate()
    }

    #[test]
    fn partial_config_takes_defaults() -> Result<()> {
        let config: Config = json5::from_str(
            r#"{
                dataset_name: "NKL",
                run_mode: "train",
                dataset: { image_size: 320 },
                tuning: { use_KLD: false },
            }"#,
        )?;

        assert_eq!(config.dataset_name, DatasetName::Nkl);
        assert_eq!(config.run_mode, RunMode::Train);
        assert_eq!(config.dataset.image_size.get(), 320);
        assert_eq!(config.dataset.batch_size.get(), 2);
        assert!(!config.tuning.use_kld);
        assert!(config.tuning.use_semantic_feat);
        assert_eq!(config.training, TrainingConfig::default());
        Ok(())
    }

    #[test]
    fn zero_image_size_is_rejected() {
        let result: Result<Config, _> = json5::from_str("{ dataset: { image_size: 0 } }");
        assert!(result.is_err());
    }

    #[test]
    fn dataset_names() {
        let names: Vec<_> = DatasetName::iter().map(|name| name.to_string()).collect();
        assert_eq!(names, ["SEL", "SEL_Hard", "NKL", "CDL"]);
        assert_eq!("SEL_Hard".parse::<DatasetName>().unwrap(), DatasetName::SelHard);

        assert!(DatasetName::SelHard.is_hard());
        assert!(!DatasetName::Sel.is_hard());
        assert_eq!(DatasetName::SelHard.checkpoint_source(), DatasetName::Sel);
        assert_eq!(DatasetName::Cdl.checkpoint_source(), DatasetName::Cdl);

        assert_eq!(DatasetName::Sel.max_lines(), 6);
        assert_eq!(DatasetName::SelHard.max_lines(), 6);
        assert_eq!(DatasetName::Nkl.max_lines(), 8);
        assert_eq!(DatasetName::Cdl.max_lines(), 8);
    }

    #[test]
    fn enum_names_match_serde_names() -> Result<()> {
        assert_eq!(RunMode::TestPaper.to_string(), "test_paper");
        assert_eq!(serde_json::to_string(&RunMode::TestPaper)?, r#""test_paper""#);
        assert_eq!(OptimizerMode::AdamW.to_string(), "adam_w");
        assert_eq!(serde_json::to_string(&OptimizerMode::AdamW)?, r#""adam_w""#);
        assert_eq!(BackboneKind::ResNet50.to_string(), "resnet50");
        assert_eq!(serde_json::to_string(&BackboneKind::ResNet50)?, r#""resnet50""#);
        Ok(())
    }

    #[test]
    fn exp_name_follows_tuning_flags() {
        let mut tuning = TuningConfig::default();
        assert_eq!(tuning.exp_name(), "MS_agg_mq8_nq1024_semantic_feat_w_KLD");

        tuning.use_semantic_feat = false;
        assert_eq!(tuning.exp_name(), "MS_agg_mq8_nq1024_image_feat_w_KLD");

        tuning.use_kld = false;
        assert_eq!(tuning.exp_name(), "MS_agg_mq8_nq1024_image_feat_wo_KLD");

        tuning.use_semantic_feat = true;
        tuning.num_region_queries = 4;
        tuning.num_anchors = 512;
        assert_eq!(tuning.exp_name(), "MS_agg_mq4_nq512_semantic_feat_wo_KLD");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.network.nheads = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.scheduler.milestones = vec![30, 30, 60];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.scheduler.milestones = vec![100, 400];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.scheduler.gamma = r64(1.5);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.testing.prob_threshold = r64(1.2);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tuning.topk = 2048;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model_name = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dataset.std[1] = r64(0.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.testing.start_eval_epoch = 301;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.dropout = r64(1.1);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.matcher.focal_alpha = r64(-0.1);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.testing.test_nms_threshold = r64(2.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.interm_loss_coef = r64(1.5);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.backbone_lr = r64(0.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.lr = r64(-1e-4);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.optimizer.betas = (r64(0.9), r64(1.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn boundary_values_are_accepted() -> Result<()> {
        let mut config = Config::default();
        config.testing.start_eval_epoch = config.training.epochs;
        config.network.dropout = r64(1.0);
        config.matcher.focal_alpha = r64(0.0);
        config.training.optimizer.betas = (r64(0.0), r64(0.999));
        config.validate()
    }
}
