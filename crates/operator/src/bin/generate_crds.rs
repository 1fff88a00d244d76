use kube::CustomResourceExt;
use trainjob_operator::crd::TrainingJob;

fn main() -> anyhow::Result<()> {
    println!("---");
    println!("# TrainingJob CRD");
    println!("{}", serde_yaml::to_string(&TrainingJob::crd())?);
    Ok(())
}
