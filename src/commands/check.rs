use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use netpolicy_controller::config::Config;

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    let config = Config::from_env();

    // 3. List pods permission in the target namespace
    print!("  List pods in '{}' ........... ", config.namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. Namespace object readable (needed for finalizer management + mode annotation)
    print!("  Namespace object readable ... ");
    match crate::k8s::read_namespace(&client, &config.namespace).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    println!("\nAll checks completed.");
    Ok(())
}
