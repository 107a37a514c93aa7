use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    tonic_build::configure()
        .type_attribute(
            "skiff_rpc.ContainerSummary",
            "#[derive(serde::Serialize,serde::Deserialize)]",
        )
        .type_attribute("skiff_rpc.ImageSummary", "#[derive(serde::Serialize,serde::Deserialize)]")
        .type_attribute("skiff_rpc.VolumeSummary", "#[derive(serde::Serialize,serde::Deserialize)]")
        .type_attribute("skiff_rpc.PluginSummary", "#[derive(serde::Serialize,serde::Deserialize)]")
        .type_attribute("skiff_rpc.UpdateResponse", "#[derive(serde::Serialize,serde::Deserialize)]")
        .type_attribute("skiff_rpc.PruneResponse", "#[derive(serde::Serialize,serde::Deserialize)]")
        .type_attribute(
            "skiff_rpc.DeploySuccess",
            "#[derive(serde::Serialize,serde::Deserialize)]",
        )
        .compile_protos(&["src/rpc/skiff_rpc.proto"], &["src"])?;
    Ok(())
}
