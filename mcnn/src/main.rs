mod crowd_input;
mod fit_mcnn;
mod visualize;

use clap::Parser;
use fit_mcnn::*;
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "MCNN",
    long_about = "Multi-column CNN for crowd counting\n\
		  Regress crowd density maps from images and keep the parameters\n\
		  with the lowest count error on the test images.\n\
		  The dataset root should contain `train_data/{images,ground_truth}`\n\
		  and `test_data/{images,ground_truth}`."
)]
struct Cli {
    #[command(flatten)]
    args: TrainArgs,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    fit_mcnn(&cli.args)?;

    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn dataset_is_required() {
        let err = Cli::try_parse_from(["mcnn", "--epoch", "3"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn defaults_match_the_reference_run() {
        let cli = Cli::try_parse_from(["mcnn", "--dataset", "data/part_A"]).unwrap();
        assert_eq!(&*cli.args.dataset, "data/part_A");
        assert_eq!(cli.args.epoch, 2000);
        assert!(!cli.args.novis);
        assert!(cli.args.pretrained_file().is_none());
        assert_eq!(cli.args.gt_downsample, 4);
        approx::assert_abs_diff_eq!(cli.args.learning_rate, 1e-6);
        approx::assert_abs_diff_eq!(cli.args.momentum, 0.95);
    }

    #[test]
    fn empty_pretrained_means_none() {
        let cli =
            Cli::try_parse_from(["mcnn", "--dataset", "d", "--pretrained", "", "--novis"]).unwrap();
        assert!(cli.args.pretrained_file().is_none());
        assert!(cli.args.novis);

        let cli =
            Cli::try_parse_from(["mcnn", "--dataset", "d", "--pretrained", "m.pth"]).unwrap();
        assert_eq!(cli.args.pretrained_file(), Some("m.pth"));
    }
}
