use rumqttcb::{Client, LogCrateAdapter, QoS};
use std::thread;
use std::time::Duration;

fn main() {
    pretty_env_logger::init();
    rumqttcb::init().unwrap();

    let client = Client::new(Some("test-1")).unwrap();
    client.set_logger(Box::new(LogCrateAdapter::new("syncpubsub")));
    client
        .will_set("hello/world", "good bye", QoS::AtMostOnce, false)
        .unwrap();

    client.on_connect(|code| println!("Connected = {:?}", code));
    client.on_subscribe(|mid, granted| println!("Subscribed. Mid = {}, Granted = {:?}", mid, granted));
    client.on_publish(|mid| println!("Acked. Mid = {}", mid));
    client.on_message(|message| println!("Message = {:?}", message));
    client.on_disconnect(|unexpected| println!("Disconnected. Unexpected = {}", unexpected));

    client
        .connect("localhost", 1883, Duration::from_secs(5))
        .unwrap();
    client.loop_start().unwrap();

    client.subscribe("hello/+/world", QoS::AtMostOnce).unwrap();
    for i in 0..10_usize {
        let payload = vec![1; i];
        let topic = format!("hello/{}/world", i);
        client.publish(topic, QoS::AtLeastOnce, true, payload).unwrap();
    }

    thread::sleep(Duration::from_secs(1));
    client.disconnect().unwrap();
    client.loop_stop(false).unwrap();

    drop(client);
    rumqttcb::cleanup();
    println!("Done!!");
}
