use clap::Parser;
use fcprep::data::{DataConfig, MNIST_URL};
use fcprep::ten;
use log::info;
use ndarray::Array2;
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fcprep",
    about = "Load, normalize and sanity check the pickled MNIST archive",
    version
)]
struct Cli {
    /// Archive URL, without the `.gz` extension.
    #[arg(long, default_value = MNIST_URL)]
    url: String,
    /// Directory the archive is cached in.
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// Tolerance of the normalization checks.
    #[arg(long, default_value_t = ten::NEAR_ZERO_TOL)]
    tol: f32,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Cli::parse();

    let mut config = DataConfig::new().url(args.url);
    if let Some(dir) = args.data_dir {
        config = config.base_path(dir);
    }

    let data = config.load()?;
    info!(
        "train {:?} / {:?}, valid {:?} / {:?}",
        data.x_train.shape(),
        data.y_train.shape(),
        data.x_valid.shape(),
        data.y_valid.shape()
    );

    let (data, (mean, std)) = data.normalized()?;
    let (train_mean, train_std) = ten::stats(&data.x_train)?;
    let (valid_mean, valid_std) = ten::stats(&data.x_valid)?;
    ten::check_near_zero(train_mean, args.tol)?;
    ten::check_near_zero(1.0 - train_std, args.tol)?;

    // Baseline: always predict the mean training label.
    let y_train = data.y_train.mapv(|y| y as f32);
    let y_valid = data.y_valid.mapv(|y| y as f32);
    let guess = y_train.mean().unwrap_or_default();
    let pred = Array2::from_elem((y_valid.len(), 1), guess);
    let baseline = ten::mse(&pred, &y_valid)?;

    println!("input stats:      mean {mean:.4}, std {std:.4}");
    println!("normalized train: mean {train_mean:.6}, std {train_std:.6}");
    println!("normalized valid: mean {valid_mean:.6}, std {valid_std:.6}");
    println!("constant {guess:.4} baseline mse on valid: {baseline:.4}");
    Ok(())
}
