//! Settings aggregation and derived experiment paths.

use crate::{common::*, config::*, schedule::MultiStepLr};

/// The name of the options log file in the weight directory.
pub const LOG_FILE_NAME: &str = "log.txt";

/// The directory layout the experiment runs in.
///
/// The code directory is expected to sit next to its output directory, e.g.
/// `<root>/code` and `<root>/output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    code_name: String,
}

impl Workspace {
    /// Build the workspace from the code directory.
    pub fn from_code_dir<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        // every derived path is logged as text
        ensure!(
            dir.to_str().is_some(),
            "'{}' is not a UTF-8 path",
            dir.display()
        );

        let code_name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| format_err!("'{}' has no UTF-8 directory name", dir.display()))?
            .to_string();
        let root = dir
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| format_err!("'{}' has no parent directory", dir.display()))?
            .to_path_buf();

        Ok(Self { root, code_name })
    }

    /// Build the workspace from the current working directory.
    pub fn current() -> Result<Self> {
        let dir = std::env::current_dir().context("failed to get the working directory")?;
        Self::from_code_dir(dir)
    }

    /// The parent of the code directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn code_name(&self) -> &str {
        &self.code_name
    }

    pub fn proj_root(&self) -> PathBuf {
        self.root.join(&self.code_name)
    }

    /// The name of the sibling output directory.
    pub fn output_name(&self) -> String {
        self.code_name.replace("code", "output")
    }
}

/// Values derived from the dataset options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetGeometry {
    pub dataset_root: PathBuf,
    pub height: usize,
    pub width: usize,
    /// The largest line distance from the image center.
    pub max_radius: usize,
    /// The maximum number of lines per image.
    pub n_max: usize,
}

impl DatasetGeometry {
    fn new(config: &Config, workspace: &Workspace) -> Self {
        let image_size = config.dataset.image_size.get();
        let dataset_name: &str = config.dataset_name.as_ref();
        let dataset_root = workspace
            .root()
            .join("../..")
            .join("Datasets")
            .join(dataset_name);

        Self {
            dataset_root,
            height: image_size,
            width: image_size,
            max_radius: image_size / 2,
            n_max: config.dataset_name.max_lines(),
        }
    }
}

/// Output and checkpoint locations of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentPaths {
    pub root: PathBuf,
    pub code_name: String,
    pub output_name: String,
    pub proj_root: PathBuf,
    pub output_root: PathBuf,
    pub exp_name: String,
    /// Visualization output directory.
    pub viz_dir: PathBuf,
    /// Model weight directory.
    pub save_folder: PathBuf,
    /// The detector checkpoint to start from.
    pub detector_ckpt: PathBuf,
    /// The SLCD checkpoint to start from.
    pub init_model: PathBuf,
    /// Cached detector outputs.
    pub pickle_dir: PathBuf,
}

impl ExperimentPaths {
    fn new(config: &Config, workspace: &Workspace, exp: &str) -> Self {
        let dataset_name: &str = config.dataset_name.as_ref();
        let root = workspace.root().to_path_buf();
        let output_name = workspace.output_name();
        let output_root = root.join(&output_name).join(exp);

        let exp_name = format!("{}{}", config.model_name, dataset_name);
        let viz_dir = output_root.join("display").join(&exp_name);
        let save_folder = output_root.join("weights").join(&exp_name);

        let (detector_ckpt, init_model, pickle_dir) = match config.run_mode {
            RunMode::TestPaper => {
                let checkpoint_dir = root.join("../pretrained");
                let checkpoint_name = format!("checkpoint_paper_{}.pth", dataset_name);
                let detector_ckpt = checkpoint_dir.join("Detector").join(&checkpoint_name);
                let init_model = checkpoint_dir.join("SLCD").join(&checkpoint_name);
                let pickle_dir = root
                    .join("../../Preprocessing")
                    .join(dataset_name)
                    .join("pickle");
                (detector_ckpt, init_model, pickle_dir)
            }
            RunMode::Train | RunMode::Test => {
                let detector_dir = root
                    .join(&output_name)
                    .join("Detector_result")
                    .join(dataset_name);
                let detector_ckpt = detector_dir.join("ckpt/checkpoint_best_recall.pth");
                let init_model = save_folder.join("ckpt/checkpoint_best_line_detection.pth");
                let pickle_dir = detector_dir.join("forward_detector/pickle");
                (detector_ckpt, init_model, pickle_dir)
            }
        };

        // hard subsets share the checkpoints of their source dataset
        let (detector_ckpt, init_model) = if config.dataset_name.is_hard() {
            let source = config.dataset_name.checkpoint_source();
            (
                replace_in_path(&detector_ckpt, dataset_name, source.as_ref()),
                replace_in_path(&init_model, dataset_name, source.as_ref()),
            )
        } else {
            (detector_ckpt, init_model)
        };

        Self {
            proj_root: workspace.proj_root(),
            code_name: workspace.code_name().to_string(),
            root,
            output_name,
            output_root,
            exp_name,
            viz_dir,
            save_folder,
            detector_ckpt,
            init_model,
            pickle_dir,
        }
    }
}

/// The aggregated experiment settings.
///
/// It is built once by [Settings::aggregate] and stays immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    #[serde(flatten)]
    config: Config,
    #[serde(flatten)]
    geometry: DatasetGeometry,
    exp: String,
    #[serde(flatten)]
    paths: ExperimentPaths,
    #[serde(skip)]
    backbone_schedule: MultiStepLr,
    #[serde(skip)]
    schedule: MultiStepLr,
}

impl Settings {
    /// Validate the configuration and derive the dataset values, the
    /// experiment name and the paths, in this order.
    ///
    /// It has no side effects.
    pub fn aggregate(config: Config, workspace: &Workspace) -> Result<Self> {
        config.validate()?;

        let geometry = DatasetGeometry::new(&config, workspace);
        let backbone_schedule =
            MultiStepLr::new(config.training.backbone_lr, &config.training.scheduler)?;
        let schedule = MultiStepLr::new(config.training.lr, &config.training.scheduler)?;
        let exp = config.tuning.exp_name();
        let paths = ExperimentPaths::new(&config, workspace, &exp);

        debug!("aggregated settings for experiment '{}'", exp);

        Ok(Self {
            config,
            geometry,
            exp,
            paths,
            backbone_schedule,
            schedule,
        })
    }

    /// Aggregate the settings, create the output directories and append
    /// the options to the log file.
    pub fn setup(config: Config, workspace: &Workspace) -> Result<Self> {
        let settings = Self::aggregate(config, workspace)?;
        settings.create_dirs()?;
        settings.log_configs()?;
        Ok(settings)
    }

    /// Create the visualization and weight directories. The pickle
    /// directory is created too unless the paper checkpoints are used.
    pub fn create_dirs(&self) -> Result<()> {
        let ExperimentPaths {
            viz_dir,
            save_folder,
            pickle_dir,
            ..
        } = &self.paths;

        let mut dirs = vec![viz_dir, save_folder];
        if self.config.run_mode != RunMode::TestPaper {
            dirs.push(pickle_dir);
        }

        dirs.into_iter().try_for_each(|dir| -> Result<_> {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory '{}'", dir.display()))?;
            debug!("using directory {}", dir.display());
            Ok(())
        })?;

        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn geometry(&self) -> &DatasetGeometry {
        &self.geometry
    }

    /// The experiment name derived from the tuning options.
    pub fn exp(&self) -> &str {
        &self.exp
    }

    pub fn paths(&self) -> &ExperimentPaths {
        &self.paths
    }

    /// The location of the options log.
    pub fn log_path(&self) -> PathBuf {
        self.paths.save_folder.join(LOG_FILE_NAME)
    }

    pub fn backbone_schedule(&self) -> &MultiStepLr {
        &self.backbone_schedule
    }

    pub fn schedule(&self) -> &MultiStepLr {
        &self.schedule
    }

    /// The backbone learning rate at the epoch.
    pub fn backbone_lr_at(&self, epoch: usize) -> f64 {
        self.backbone_schedule.lr_at(epoch)
    }

    /// The learning rate of non-backbone parameters at the epoch.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        self.schedule.lr_at(epoch)
    }
}

/// Replace the pattern in each UTF-8 component of the path.
fn replace_in_path(path: &Path, from: &str, to: &str) -> PathBuf {
    path.components()
        .map(|component| match component {
            Component::Normal(name) => match name.to_str() {
                Some(name) => PathBuf::from(name.replace(from, to)),
                None => PathBuf::from(name),
            },
            other => PathBuf::from(other.as_os_str()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::from_code_dir("/work/SLCD/code").unwrap()
    }

    #[test]
    fn workspace_from_code_dir() -> Result<()> {
        let workspace = workspace();
        assert_eq!(workspace.root(), Path::new("/work/SLCD"));
        assert_eq!(workspace.code_name(), "code");
        assert_eq!(workspace.proj_root(), Path::new("/work/SLCD/code"));
        assert_eq!(workspace.output_name(), "output");

        let workspace = Workspace::from_code_dir("/work/SLCD/code_v2")?;
        assert_eq!(workspace.output_name(), "output_v2");

        assert!(Workspace::from_code_dir("/").is_err());
        assert!(Workspace::from_code_dir("code").is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_root_is_rejected() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let root = Path::new("/work").join(OsStr::from_bytes(b"SLCD\xff"));
        assert!(Workspace::from_code_dir(root.join("code")).is_err());
    }

    #[test]
    fn geometry_follows_image_size() -> Result<()> {
        for &(image_size, max_radius) in &[(480, 240), (384, 192), (321, 160)] {
            let mut config = Config::default();
            config.dataset.image_size = NonZeroUsize::new(image_size).unwrap();
            let settings = Settings::aggregate(config, &workspace())?;
            let geometry = settings.geometry();

            assert_eq!(geometry.width, image_size);
            assert_eq!(geometry.height, image_size);
            assert_eq!(geometry.max_radius, max_radius);
        }
        Ok(())
    }

    #[test]
    fn default_paper_paths() -> Result<()> {
        let settings = Settings::aggregate(Config::default(), &workspace())?;
        let paths = settings.paths();
        let exp = "MS_agg_mq8_nq1024_semantic_feat_w_KLD";

        assert_eq!(settings.exp(), exp);
        assert_eq!(settings.geometry().n_max, 6);
        assert_eq!(
            settings.geometry().dataset_root,
            Path::new("/work/SLCD/../../Datasets/SEL")
        );
        assert_eq!(paths.exp_name, "combination_SEL");
        assert_eq!(paths.output_root, Path::new("/work/SLCD/output").join(exp));
        assert_eq!(
            paths.viz_dir,
            paths.output_root.join("display/combination_SEL")
        );
        assert_eq!(
            paths.save_folder,
            paths.output_root.join("weights/combination_SEL")
        );
        assert_eq!(
            paths.detector_ckpt,
            Path::new("/work/SLCD/../pretrained/Detector/checkpoint_paper_SEL.pth")
        );
        assert_eq!(
            paths.init_model,
            Path::new("/work/SLCD/../pretrained/SLCD/checkpoint_paper_SEL.pth")
        );
        assert_eq!(
            paths.pickle_dir,
            Path::new("/work/SLCD/../../Preprocessing/SEL/pickle")
        );
        assert_eq!(
            settings.log_path(),
            paths.save_folder.join("log.txt")
        );
        Ok(())
    }

    #[test]
    fn training_paths() -> Result<()> {
        let config = Config {
            dataset_name: DatasetName::Nkl,
            run_mode: RunMode::Train,
            ..Default::default()
        };
        let settings = Settings::aggregate(config, &workspace())?;
        let paths = settings.paths();

        assert_eq!(settings.geometry().n_max, 8);
        assert_eq!(
            paths.detector_ckpt,
            Path::new("/work/SLCD/output/Detector_result/NKL/ckpt/checkpoint_best_recall.pth")
        );
        assert_eq!(
            paths.init_model,
            paths
                .save_folder
                .join("ckpt/checkpoint_best_line_detection.pth")
        );
        assert_eq!(
            paths.pickle_dir,
            Path::new("/work/SLCD/output/Detector_result/NKL/forward_detector/pickle")
        );
        Ok(())
    }

    #[test]
    fn hard_subset_reuses_source_checkpoints() -> Result<()> {
        let config = Config {
            dataset_name: DatasetName::SelHard,
            ..Default::default()
        };
        let settings = Settings::aggregate(config, &workspace())?;
        let paths = settings.paths();

        assert_eq!(paths.exp_name, "combination_SEL_Hard");
        assert!(paths.save_folder.ends_with("weights/combination_SEL_Hard"));
        assert_eq!(
            paths.init_model,
            Path::new("/work/SLCD/../pretrained/SLCD/checkpoint_paper_SEL.pth")
        );
        assert_eq!(
            paths.detector_ckpt,
            Path::new("/work/SLCD/../pretrained/Detector/checkpoint_paper_SEL.pth")
        );
        assert_eq!(
            paths.pickle_dir,
            Path::new("/work/SLCD/../../Preprocessing/SEL_Hard/pickle")
        );

        let config = Config {
            dataset_name: DatasetName::SelHard,
            run_mode: RunMode::Test,
            ..Default::default()
        };
        let settings = Settings::aggregate(config, &workspace())?;
        let paths = settings.paths();

        assert!(paths
            .init_model
            .ends_with("weights/combination_SEL/ckpt/checkpoint_best_line_detection.pth"));
        assert_eq!(
            paths.detector_ckpt,
            Path::new("/work/SLCD/output/Detector_result/SEL/ckpt/checkpoint_best_recall.pth")
        );
        assert_eq!(
            paths.pickle_dir,
            Path::new("/work/SLCD/output/Detector_result/SEL_Hard/forward_detector/pickle")
        );
        Ok(())
    }

    #[test]
    fn aggregation_is_deterministic() -> Result<()> {
        let lhs = Settings::aggregate(Config::default(), &workspace())?;
        let rhs = Settings::aggregate(Config::default(), &workspace())?;
        assert_eq!(lhs, rhs);
        Ok(())
    }

    #[test]
    fn tuning_flags_change_output_root() -> Result<()> {
        let mut config = Config::default();
        config.tuning.use_kld = false;
        let settings = Settings::aggregate(config, &workspace())?;

        assert_eq!(settings.exp(), "MS_agg_mq8_nq1024_semantic_feat_wo_KLD");
        assert_eq!(
            settings.paths().output_root,
            Path::new("/work/SLCD/output/MS_agg_mq8_nq1024_semantic_feat_wo_KLD")
        );
        Ok(())
    }

    #[test]
    fn invalid_config_is_not_aggregated() {
        let mut config = Config::default();
        config.tuning.topk = 0;
        assert!(Settings::aggregate(config, &workspace()).is_err());
    }
}
