//! Wires a bus end to end: an HTTP service declared in configuration, a
//! polling subscription against it, and a binder that turns each XML
//! response into a dynamic tree.
//!
//! Point QUOTE_URL at a reachable endpoint to see live models; against the
//! default placeholder the responses carry connection errors instead.

use std::time::Duration;

use messagebus::binding::{BindKind, BindingSet, RuleBinder};
use messagebus::{
	Bus, ConfigLoader, ContentType, ControlAction, FnListener, MessageRef, MessageType,
	data_binder,
};

const CONFIG: &str = r#"
<messagebus-config>
    <service name="quotes" url="${QUOTE_URL}" type="http">
        <httpConfig timeout="5" httpMethod="GET" contentType="xml" subscribe="true"/>
        <headers>
            <header name="Accept" value="text/xml"/>
        </headers>
        <requestTemplate><![CDATA[symbol={{symbol}}]]></requestTemplate>
        <bindings>
            <bind path="*/quote" type="map" key="quote">
                <bind path="price" type="value" key="price"/>
                <bind path="volume" type="value" key="volume"/>
            </bind>
        </bindings>
    </service>
</messagebus-config>
"#;

fn main() {
	bus_core::telemetry::setup_logging();

	let bus = Bus::new();
	let mut loader = ConfigLoader::new(bus.clone());
	loader.set_token(
		"QUOTE_URL",
		&std::env::var("QUOTE_URL").unwrap_or_else(|_| "http://127.0.0.1:9/quotes".to_owned()),
	);
	loader.load_str(CONFIG).expect("configuration should load");

	// Watch every response posted back under the service subject.
	let listener = FnListener::new(|message: &MessageRef| {
		let message = message.lock();
		if message.is_error() {
			eprintln!("error {}: {}", message.error_code, message.error_desc);
		} else if message.content_type == ContentType::Model {
			if let Some(model) = message.model() {
				println!("{}", model.read().to_json_pretty());
			}
		}
	});
	bus.register_listener("quotes", listener).expect("listener registers");

	// A binder shaped like the configured bindings; each response stream
	// is unmarshalled through it.
	let mut binder = RuleBinder::with_bindings(&BindingSet::new());
	binder.add_binding("*/quote", BindKind::Map, "quote", "");
	binder.add_value_binding("*/quote/price", "price", false);
	binder.add_value_binding("*/quote/volume", "volume", false);

	let request = bus.create_message("quotes", MessageType::Req, true);
	{
		let mut request = request.lock();
		request.set_param("symbol", "ACME");
		request.data_binder = Some(data_binder(binder));
		// Poll every two seconds until cancelled.
		request.set_delay(Duration::from_secs(2), true, false);
	}
	let subscription_id = request.lock().id();
	bus.post(&request, None).expect("subscription posts");

	std::thread::sleep(Duration::from_secs(7));

	let cancel = bus.create_message("quotes", MessageType::P2P, true);
	cancel
		.lock()
		.set_control(ControlAction::Cancel, Some(subscription_id));
	bus.post(&cancel, None).expect("cancel posts");

	std::thread::sleep(Duration::from_millis(200));
	bus.shutdown();
}
