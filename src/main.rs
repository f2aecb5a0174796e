//! Demo de extremo a extremo sobre la configuración del entorno:
//! dos pestañas con la misma request, un broker que drena el spool y el poll
//! final de la pestaña redirigida.

use dispatchflow::{build_services, AppConfig, Services};
use dispatch_core::{list_records, DispatchRequest, JobStatus, RequestParameters, UserIdentity};
use serde_json::json;

fn run(services: &Services) -> Result<(), Box<dyn std::error::Error>> {
    let alice = UserIdentity::user("alice").with_email("alice@example.org");
    let params = RequestParameters::new().with("instrument", "isgri")
                                         .with("product_type", "isgri_image")
                                         .with("E1_keV", 20)
                                         .with("E2_keV", 40)
                                         .with("scw_list", json!(["066500230010.001", "066500220010.001"]));

    let first = services.machine.handle_request(DispatchRequest::new(params.clone(), alice.clone()))?;
    println!("first tab:  {}", serde_json::to_string(&first)?);
    let second = services.machine.handle_request(DispatchRequest::new(params, alice.clone()))?;
    println!("second tab: {} (aliased={})", second.key, second.is_aliased());

    for ticket in services.spool.pending()? {
        if !ticket.is_intact() {
            eprintln!("ticket {} corrupto, se omite", ticket.file_name());
            continue;
        }
        for (status, details) in [(JobStatus::Progress, json!({"step": "ii_skyimage"})),
                                  (JobStatus::Done, json!({"image": format!("{}_mosaic.fits", ticket.job_id)}))]
        {
            let callback = ticket.callback(services.store.as_ref(), status, details)?;
            let outcome = services.machine.on_backend_status(callback)?;
            println!("callback {status}: {}", serde_json::to_string(&outcome)?);
        }
        services.spool.take(&ticket)?;
    }

    let polled = services.machine.handle_request(DispatchRequest::poll(&second.key, alice))?;
    println!("second tab poll: {}", serde_json::to_string(&polled)?);
    println!("metrics: {:?}", services.machine.metrics().snapshot());
    for info in list_records(services.store.as_ref())? {
        println!("gc: {}", serde_json::to_string(&info)?);
    }
    Ok(())
}

fn main() {
    let cfg = AppConfig::from_env();
    let services = match build_services(&cfg) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[dispatchflow-demo] wiring error: {e}");
            std::process::exit(5);
        }
    };
    if let Err(e) = run(&services) {
        eprintln!("[dispatchflow-demo] error: {e}");
        std::process::exit(1);
    }
}
