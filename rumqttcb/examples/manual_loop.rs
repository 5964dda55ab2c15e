use rumqttcb::{Client, QoS};
use std::time::Duration;

/// Drives the network loop with the split read/write/misc calls, the way an
/// application with its own select loop would
fn main() {
    pretty_env_logger::init();
    rumqttcb::init().unwrap();

    let client = Client::new(None).unwrap();
    client.on_log(|level, line| println!("{:?}: {}", level, line));
    client.on_message(|message| println!("{} = {}", message.topic, message.payload_str()));

    client
        .connect_async("localhost", 1883, Duration::from_secs(10))
        .unwrap();

    // connect_async only asks for the connection, one iteration opens it
    while !client.is_connected() {
        client.loop_once(Duration::from_millis(100), 1).unwrap();
    }

    client.subscribe("hello/#", QoS::AtLeastOnce).unwrap();
    client
        .publish("hello/manual", QoS::ExactlyOnce, false, "hi")
        .unwrap();

    for _ in 0..50 {
        if client.want_write() {
            client.loop_write().unwrap();
        }

        client.loop_read(10).unwrap();
        client.loop_misc().unwrap();
        std::thread::sleep(Duration::from_millis(100));
    }

    client.disconnect().unwrap();
    client.loop_write().unwrap();

    drop(client);
    rumqttcb::cleanup();
}
